//! Post-deserialization constraint validation.
//!
//! A handler's request type implements [`Validate`] to run declarative and
//! closure-based checks once MessagePack decoding has produced a concrete
//! value. Validators compile to a flat list of closures at registration time;
//! there is no per-call reflection.

use std::collections::BTreeMap;
use std::fmt;

/// One failing constraint against a single field (or the record as a whole).
#[derive(Clone, Debug, PartialEq)]
pub enum FieldErrorDescriptor {
    /// A leaf constraint failure.
    Description(String),
    /// A failure inside a sequence element or tuple slot, identified by index.
    Indexed {
        index: usize,
        errors: Vec<FieldErrorDescriptor>,
    },
    /// A failure inside a mapping value, identified by key.
    Keyed {
        key: String,
        errors: Vec<FieldErrorDescriptor>,
    },
}

/// Aggregated validation failure: `field -> descriptors`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ValidationError {
    pub fields: BTreeMap<String, Vec<FieldErrorDescriptor>>,
}

impl ValidationError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, field: impl Into<String>, descriptor: FieldErrorDescriptor) {
        self.fields.entry(field.into()).or_default().push(descriptor);
    }

    pub fn single(field: impl Into<String>, message: impl Into<String>) -> Self {
        let mut err = Self::new();
        err.push(field, FieldErrorDescriptor::Description(message.into()));
        err
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn merge(&mut self, other: ValidationError) {
        for (field, descriptors) in other.fields {
            self.fields.entry(field).or_default().extend(descriptors);
        }
    }

    /// Render the field map as a JSON value, suitable for `ErrorMessage::data`.
    pub fn to_json(&self) -> serde_json::Value {
        fn descriptor_json(d: &FieldErrorDescriptor) -> serde_json::Value {
            match d {
                FieldErrorDescriptor::Description(msg) => serde_json::json!({ "description": msg }),
                FieldErrorDescriptor::Indexed { index, errors } => serde_json::json!({
                    "index": index,
                    "errors": errors.iter().map(descriptor_json).collect::<Vec<_>>(),
                }),
                FieldErrorDescriptor::Keyed { key, errors } => serde_json::json!({
                    "key": key,
                    "errors": errors.iter().map(descriptor_json).collect::<Vec<_>>(),
                }),
            }
        }
        let map: serde_json::Map<String, serde_json::Value> = self
            .fields
            .iter()
            .map(|(field, descriptors)| {
                (
                    field.clone(),
                    serde_json::Value::Array(descriptors.iter().map(descriptor_json).collect()),
                )
            })
            .collect();
        serde_json::Value::Object(map)
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "validation failed for {} field(s)", self.fields.len())
    }
}

impl std::error::Error for ValidationError {}

/// Whether a record's validators stop at the first failure or collect all of them.
///
/// Returned by [`Validate::error_mode`]; the default, `FailFast`, mirrors
/// typical request validation: report the first problem and stop.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ErrorMode {
    #[default]
    FailFast,
    ReturnAllErrors,
}

/// Implemented by request (and, optionally, response) types to run
/// constraint checks after MessagePack decoding.
///
/// The default implementation passes every value; types with constraints
/// override `validate`.
pub trait Validate {
    fn validate(&self) -> Result<(), ValidationError> {
        Ok(())
    }

    fn error_mode(&self) -> ErrorMode {
        ErrorMode::FailFast
    }
}

/// The unit type carries no constraints; used as the request type of
/// handlers that take no input (e.g. the built-in introspection handler).
impl Validate for () {}

/// Runs a list of field validators against `value`, honoring `mode`.
///
/// Each validator closure receives the value and returns a descriptor on
/// failure. Used by generated/derive-free `Validate` impls to assemble their
/// `validate()` body from a flat `Vec` of closures compiled once at
/// registration.
pub fn run_field_validators<T>(
    field: &str,
    value: &T,
    validators: &[Box<dyn Fn(&T) -> Result<(), String> + Send + Sync>],
    mode: ErrorMode,
) -> Result<(), ValidationError> {
    let mut error = ValidationError::new();
    for validator in validators {
        if let Err(message) = validator(value) {
            error.push(field, FieldErrorDescriptor::Description(message));
            if mode == ErrorMode::FailFast {
                return Err(error);
            }
        }
    }
    if error.is_empty() { Ok(()) } else { Err(error) }
}

/// Runs `validator` against every element of `items`, tagging failures with
/// their index. Used for fields annotated `each`.
pub fn run_each<T>(
    items: &[T],
    validator: impl Fn(&T) -> Result<(), ValidationError>,
) -> Vec<FieldErrorDescriptor> {
    items
        .iter()
        .enumerate()
        .filter_map(|(index, item)| match validator(item) {
            Ok(()) => None,
            Err(err) => Some(FieldErrorDescriptor::Indexed {
                index,
                errors: err
                    .fields
                    .into_values()
                    .flatten()
                    .collect(),
            }),
        })
        .collect()
}

/// `value > bound`.
pub fn gt<T: PartialOrd + fmt::Debug>(bound: T) -> impl Fn(&T) -> Result<(), String> {
    move |value| {
        if *value > bound {
            Ok(())
        } else {
            Err(format!("must be greater than {bound:?}"))
        }
    }
}

/// `value >= bound`.
pub fn ge<T: PartialOrd + fmt::Debug>(bound: T) -> impl Fn(&T) -> Result<(), String> {
    move |value| {
        if *value >= bound {
            Ok(())
        } else {
            Err(format!("must be at least {bound:?}"))
        }
    }
}

/// `value < bound`.
pub fn lt<T: PartialOrd + fmt::Debug>(bound: T) -> impl Fn(&T) -> Result<(), String> {
    move |value| {
        if *value < bound {
            Ok(())
        } else {
            Err(format!("must be less than {bound:?}"))
        }
    }
}

/// `value <= bound`.
pub fn le<T: PartialOrd + fmt::Debug>(bound: T) -> impl Fn(&T) -> Result<(), String> {
    move |value| {
        if *value <= bound {
            Ok(())
        } else {
            Err(format!("must be at most {bound:?}"))
        }
    }
}

/// `value % divisor == 0`.
pub fn multiple_of(divisor: i64) -> impl Fn(&i64) -> Result<(), String> {
    move |value| {
        if divisor != 0 && value % divisor == 0 {
            Ok(())
        } else {
            Err(format!("must be a multiple of {divisor}"))
        }
    }
}

/// `min_inclusive <= len(value) < max_exclusive`.
pub fn len(min_inclusive: usize, max_exclusive: usize) -> impl Fn(&str) -> Result<(), String> {
    move |value| {
        let n = value.chars().count();
        if n >= min_inclusive && n < max_exclusive {
            Ok(())
        } else {
            Err(format!(
                "length {n} is not in [{min_inclusive}, {max_exclusive})"
            ))
        }
    }
}

/// Validates that a string names a recognized IANA timezone.
pub fn timezone() -> impl Fn(&str) -> Result<(), String> {
    move |value| {
        value
            .parse::<chrono_tz::Tz>()
            .map(|_| ())
            .map_err(|_| format!("'{value}' is not a recognized timezone"))
    }
}

/// Validates a string against a compiled regular expression.
pub fn regex(pattern: &str) -> Result<impl Fn(&str) -> Result<(), String> + use<>, regex::Error> {
    let re = regex::Regex::new(pattern)?;
    Ok(move |value: &str| {
        if re.is_match(value) {
            Ok(())
        } else {
            Err(format!("does not match pattern /{}/", re.as_str()))
        }
    })
}

/// Wraps an arbitrary predicate with a fixed failure message.
pub fn predicate<T>(
    message: impl Into<String>,
    check: impl Fn(&T) -> bool,
) -> impl Fn(&T) -> Result<(), String> {
    let message = message.into();
    move |value| {
        if check(value) {
            Ok(())
        } else {
            Err(message.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gt_rejects_boundary_and_below() {
        let check = gt(10);
        assert!(check(&11).is_ok());
        assert!(check(&10).is_err());
        assert!(check(&9).is_err());
    }

    #[test]
    fn len_checks_char_count_not_byte_count() {
        let check = len(1, 4);
        assert!(check("abc").is_ok());
        assert!(check("").is_err());
        assert!(check("abcd").is_err());
    }

    #[test]
    fn timezone_accepts_iana_name_rejects_garbage() {
        let check = timezone();
        assert!(check("America/New_York").is_ok());
        assert!(check("Mars/Olympus_Mons").is_err());
    }

    #[test]
    fn regex_compiles_once_and_matches() {
        let check = regex(r"^\d+$").unwrap();
        assert!(check("12345").is_ok());
        assert!(check("12a45").is_err());
    }

    #[test]
    fn fail_fast_stops_at_first_failure() {
        let validators: Vec<Box<dyn Fn(&i64) -> Result<(), String> + Send + Sync>> = vec![
            Box::new(|v: &i64| if *v > 0 { Ok(()) } else { Err("must be positive".into()) }),
            Box::new(|v: &i64| if *v < 100 { Ok(()) } else { Err("must be under 100".into()) }),
        ];
        let err = run_field_validators("amount", &-5, &validators, ErrorMode::FailFast).unwrap_err();
        assert_eq!(err.fields.get("amount").unwrap().len(), 1);
    }

    #[test]
    fn return_all_errors_collects_every_failure() {
        let validators: Vec<Box<dyn Fn(&i64) -> Result<(), String> + Send + Sync>> = vec![
            Box::new(|_: &i64| Err::<(), String>("first".into())),
            Box::new(|_: &i64| Err::<(), String>("second".into())),
        ];
        let err =
            run_field_validators("amount", &5, &validators, ErrorMode::ReturnAllErrors).unwrap_err();
        assert_eq!(err.fields.get("amount").unwrap().len(), 2);
    }

    #[test]
    fn validation_error_to_json_nests_indexed_descriptors() {
        let mut err = ValidationError::new();
        err.push(
            "items",
            FieldErrorDescriptor::Indexed {
                index: 2,
                errors: vec![FieldErrorDescriptor::Description("too small".into())],
            },
        );
        let json = err.to_json();
        assert_eq!(json["items"][0]["index"], 2);
    }
}
