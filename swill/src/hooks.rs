//! Lifecycle hook lists.
//!
//! A hook list holds zero or more boxed async callbacks invoked in
//! registration order, the same layered-builder style used for accumulating
//! `tower` layers on a service builder. Hooks observe a
//! call's identity and metadata rather than its typed payload: a single
//! dispatcher-wide hook list is necessarily generic across every registered
//! RPC's distinct request/response types, so hooks that need the decoded
//! value belong on the handler closure itself, not the hook list.

use futures::future::BoxFuture;
use std::sync::Arc;
use swill_core::Metadata;

use crate::call::Call;
use crate::connection::Connection;

type ConnectionHook = Arc<dyn Fn(&Connection) -> BoxFuture<'static, ()> + Send + Sync>;
type CallHook = Arc<dyn Fn(&Call) -> BoxFuture<'static, ()> + Send + Sync>;
type MetadataHook = Arc<dyn Fn(&Call, &Metadata) -> BoxFuture<'static, ()> + Send + Sync>;

/// The full set of lifecycle hook lists a [`crate::dispatch::Dispatcher`] carries.
#[derive(Clone, Default)]
pub struct Hooks {
    pub before_connection: Vec<ConnectionHook>,
    pub after_accept: Vec<ConnectionHook>,
    pub before_request: Vec<CallHook>,
    pub before_request_data: Vec<CallHook>,
    pub before_request_message: Vec<CallHook>,
    pub before_leading_metadata: Vec<MetadataHook>,
    pub before_response_message: Vec<CallHook>,
    pub before_trailing_metadata: Vec<MetadataHook>,
    pub after_request: Vec<CallHook>,
    pub after_connection: Vec<ConnectionHook>,
}

impl Hooks {
    pub async fn run_connection(hooks: &[ConnectionHook], connection: &Connection) {
        for hook in hooks {
            hook(connection).await;
        }
    }

    pub async fn run_call(hooks: &[CallHook], call: &Call) {
        for hook in hooks {
            hook(call).await;
        }
    }

    pub async fn run_metadata(hooks: &[MetadataHook], call: &Call, metadata: &Metadata) {
        for hook in hooks {
            hook(call, metadata).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::CallKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn call_hooks_run_in_registration_order() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let o1 = order.clone();
        let o2 = order.clone();
        let hooks: Vec<CallHook> = vec![
            Arc::new(move |_call: &Call| {
                let o1 = o1.clone();
                Box::pin(async move { o1.lock().unwrap().push(1) })
            }),
            Arc::new(move |_call: &Call| {
                let o2 = o2.clone();
                Box::pin(async move { o2.lock().unwrap().push(2) })
            }),
        ];
        let call = Call::new("add", 1, CallKind::UnaryUnary, None);
        Hooks::run_call(&hooks, &call).await;
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn counts_are_independent_per_list() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let hook: CallHook = Arc::new(move |_call: &Call| {
            c.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {})
        });
        let hooks = Hooks { before_request: vec![hook], ..Default::default() };
        assert_eq!(hooks.before_request.len(), 1);
        assert_eq!(hooks.after_request.len(), 0);
    }
}
