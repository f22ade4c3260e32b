//! Scripted transport for driving flows in unit tests

use super::transport::{HttpRequest, HttpResponse, Transport, TransportError};
use async_trait::async_trait;
use reqwest::StatusCode;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

enum Step {
    Respond(HttpResponse),
    Fail(String),
}

/// Answers requests from a FIFO script and records every request it saw.
///
/// Running out of script is a test bug, so it panics.
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Step>>,
    seen: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn respond(&self, status: u16, body: &str) -> &Self {
        let status = StatusCode::from_u16(status).unwrap();
        self.script
            .lock()
            .unwrap()
            .push_back(Step::Respond(HttpResponse::new(status, body)));
        self
    }

    pub fn fail(&self) -> &Self {
        self.script
            .lock()
            .unwrap()
            .push_back(Step::Fail("connection refused".to_string()));
        self
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.seen.lock().unwrap().clone()
    }

    pub fn urls(&self) -> Vec<String> {
        self.requests().into_iter().map(|r| r.url).collect()
    }

    pub fn call_count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().unwrap().len()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let url = request.url.clone();
        self.seen.lock().unwrap().push(request);
        match self.script.lock().unwrap().pop_front() {
            Some(Step::Respond(resp)) => Ok(resp),
            Some(Step::Fail(msg)) => Err(TransportError(msg)),
            None => panic!("unscripted request to {}", url),
        }
    }
}
