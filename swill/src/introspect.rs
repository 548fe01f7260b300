//! The built-in `swill.introspect` handler: enumerates registered RPCs and
//! their declared request/response shapes.
//!
//! Shape description itself lives in [`crate::shape`]; this module only
//! assembles it into the per-handler listing the wire contract describes.

use std::sync::Arc;

use async_stream::stream;
use futures::Stream;
use serde::{Deserialize, Serialize};
use swill_core::Validate;

use crate::call::Call;
use crate::dispatch::{Dispatcher, DispatcherBuilder};
use crate::response::Response;
use crate::shape::{DescribeType, TypeDescriptor};

/// One end (request or response) of a registered RPC: whether it streams,
/// and the declared shape of its messages.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EndpointShape {
    pub streams: bool,
    #[serde(rename = "type")]
    pub kind: TypeDescriptor,
}

/// One registered RPC's shape, as reported by `swill.introspect`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct HandlerDescription {
    pub name: String,
    pub request: EndpointShape,
    pub response: EndpointShape,
}

impl Validate for HandlerDescription {}

/// `HandlerDescription` describes its own shape as a plain record: clients
/// introspecting introspection itself see field-named arguments rather than
/// an opaque leaf.
impl DescribeType for HandlerDescription {
    fn describe() -> TypeDescriptor {
        let mut arguments = std::collections::HashMap::new();
        arguments.insert("name".to_string(), String::describe());
        arguments.insert("request".to_string(), TypeDescriptor::leaf("endpoint_shape"));
        arguments.insert("response".to_string(), TypeDescriptor::leaf("endpoint_shape"));
        TypeDescriptor::container("record", arguments)
    }
}

/// The name reserved for the built-in introspection handler; never
/// registerable by a user, and excluded from its own listing.
pub const INTROSPECT_RPC: &str = "swill.introspect";

/// Builds the descriptor stream for `swill.introspect` against `dispatcher`.
pub fn describe_handlers(dispatcher: &Arc<Dispatcher>) -> impl Stream<Item = HandlerDescription> + use<> {
    let descriptions: Vec<HandlerDescription> = dispatcher
        .handlers()
        .filter(|h| h.name != INTROSPECT_RPC)
        .map(|h| HandlerDescription {
            name: h.name.clone(),
            request: EndpointShape { streams: h.kind.request_streams(), kind: h.request_type.clone() },
            response: EndpointShape { streams: h.kind.response_streams(), kind: h.response_type.clone() },
        })
        .collect();
    stream! {
        for description in descriptions {
            yield description;
        }
    }
}

/// A cell bound to the introspection handler at registration time and filled
/// in with the real dispatcher once [`crate::dispatch::DispatcherBuilder::build`]
/// runs — the handler is necessarily self-referential (it enumerates the very
/// registry it is part of), so it resolves the dispatcher indirectly rather
/// than capturing it directly.
#[derive(Clone)]
pub struct DispatcherHandle(Arc<std::sync::OnceLock<Arc<Dispatcher>>>);

impl DispatcherHandle {
    pub fn bind(&self, dispatcher: Arc<Dispatcher>) {
        let _ = self.0.set(dispatcher);
    }
}

/// Builds the `swill.introspect` handler descriptor and the handle used to
/// bind it to its own dispatcher after construction.
pub fn introspect_handler() -> (crate::handler::HandlerDescriptor, DispatcherHandle) {
    let cell: Arc<std::sync::OnceLock<Arc<Dispatcher>>> = Arc::new(std::sync::OnceLock::new());
    let handle = DispatcherHandle(cell.clone());
    let descriptor = crate::handler::unary_stream(
        INTROSPECT_RPC,
        move |_call: Arc<Call>, _request: (), _response: &mut Response| {
            let cell = cell.clone();
            async move {
                let dispatcher = cell
                    .get()
                    .expect("DispatcherHandle::bind must run before the first introspect call")
                    .clone();
                Ok::<_, crate::error::RequestError>(describe_handlers(&dispatcher))
            }
        },
    );
    (descriptor, handle)
}

/// Registers the built-in introspection handler on `builder` and binds it to
/// the dispatcher `builder` itself produces. The usual entry point for
/// wiring introspection into a server: `install(Dispatcher::builder()....)`.
pub fn install(builder: DispatcherBuilder) -> Arc<Dispatcher> {
    let (descriptor, handle) = introspect_handler();
    let dispatcher = builder.register(descriptor).build();
    handle.bind(dispatcher.clone());
    dispatcher
}
