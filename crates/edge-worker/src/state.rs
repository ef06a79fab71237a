use std::sync::Arc;

use crate::connectivity::Connectivity;
use crate::interceptor::RequestInterceptor;

#[derive(Clone)]
pub struct WorkerState {
    inner: Arc<StateInner>,
}

struct StateInner {
    interceptor: Arc<RequestInterceptor>,
}

impl WorkerState {
    pub fn new(interceptor: Arc<RequestInterceptor>) -> Self {
        Self {
            inner: Arc::new(StateInner { interceptor }),
        }
    }

    pub fn interceptor(&self) -> Arc<RequestInterceptor> {
        self.inner.interceptor.clone()
    }

    pub fn connectivity(&self) -> &Connectivity {
        self.inner.interceptor.connectivity()
    }
}
