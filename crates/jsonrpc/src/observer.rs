//! Per-instance observation of traffic.
//!
//! An observer is handed to one client or server through its config and sees
//! only the messages crossing that instance.

use crate::protocol::{Request, Response};

/// Receives every request and response crossing one client or server.
///
/// Callbacks run inline on the engine's tasks and must not block.
pub trait RpcObserver: Send + Sync {
    /// A request or notification was sent (client) or received (server).
    fn on_request(&self, request: &Request) {
        let _ = request;
    }

    /// A response was received (client) or sent (server).
    fn on_response(&self, response: &Response) {
        let _ = response;
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use parking_lot::Mutex;

    use super::RpcObserver;
    use crate::protocol::{Request, Response};

    /// Records method names and response ids for assertions.
    #[derive(Default)]
    pub struct Recorder {
        pub requests: Mutex<Vec<String>>,
        pub responses: Mutex<Vec<String>>,
    }

    impl RpcObserver for Recorder {
        fn on_request(&self, request: &Request) {
            self.requests.lock().push(request.method().to_string());
        }

        fn on_response(&self, response: &Response) {
            self.responses.lock().push(response.id().to_string());
        }
    }
}
