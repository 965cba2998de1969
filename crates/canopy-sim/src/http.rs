//! Scripted HTTP client
//!
//! Responses are scripted per URL: one-shot entries queue ahead of a
//! persistent response, and everything else gets the default error. The
//! handle is cloneable, so a test scripts and inspects while the bridge
//! node owns its copy.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::time::Duration;

use canopy_core::{GatewayError, HttpClient, HttpResponse};

/// One scripted answer
#[derive(Debug, Clone)]
pub enum Scripted {
    Respond { status: u16, body: String },
    Fail(String),
}

impl Scripted {
    pub fn ok(status: u16, body: &str) -> Self {
        Scripted::Respond {
            status,
            body: body.into(),
        }
    }

    fn into_result(self) -> Result<HttpResponse, GatewayError> {
        match self {
            Scripted::Respond { status, body } => Ok(HttpResponse { status, body }),
            Scripted::Fail(reason) => Err(GatewayError::Http(reason)),
        }
    }
}

#[derive(Default)]
struct HttpInner {
    one_shot: HashMap<String, VecDeque<Scripted>>,
    persistent: HashMap<String, Scripted>,
    log: Vec<String>,
}

/// Scripted HTTP handle
#[derive(Clone, Default)]
pub struct SimHttp {
    inner: Rc<RefCell<HttpInner>>,
}

impl SimHttp {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every request for `url` with `response`
    pub fn set(&self, url: &str, response: Scripted) {
        self.inner
            .borrow_mut()
            .persistent
            .insert(url.into(), response);
    }

    /// Queue a one-shot response for `url`, consumed before the
    /// persistent one
    pub fn push(&self, url: &str, response: Scripted) {
        self.inner
            .borrow_mut()
            .one_shot
            .entry(url.into())
            .or_default()
            .push_back(response);
    }

    /// URLs requested so far, in order
    pub fn requests(&self) -> Vec<String> {
        self.inner.borrow().log.clone()
    }

    fn serve(&self, url: &str) -> Result<HttpResponse, GatewayError> {
        let mut inner = self.inner.borrow_mut();
        inner.log.push(url.to_string());
        if let Some(queue) = inner.one_shot.get_mut(url) {
            if let Some(scripted) = queue.pop_front() {
                return scripted.into_result();
            }
        }
        match inner.persistent.get(url) {
            Some(scripted) => scripted.clone().into_result(),
            None => Err(GatewayError::Http(format!("no scripted response for {url}"))),
        }
    }
}

impl HttpClient for SimHttp {
    fn get(&mut self, url: &str, _timeout: Duration) -> Result<HttpResponse, GatewayError> {
        self.serve(url)
    }

    fn post(&mut self, url: &str, _body: &str, _timeout: Duration) -> Result<HttpResponse, GatewayError> {
        self.serve(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_shot_before_persistent() {
        let http = SimHttp::new();
        http.set("http://x", Scripted::ok(200, "steady"));
        http.push("http://x", Scripted::ok(503, "hiccup"));

        let mut client = http.clone();
        let t = Duration::from_secs(1);
        assert_eq!(client.get("http://x", t).unwrap().status, 503);
        assert_eq!(client.get("http://x", t).unwrap().status, 200);
        assert_eq!(client.get("http://x", t).unwrap().status, 200);
        assert_eq!(http.requests().len(), 3);
    }

    #[test]
    fn test_unscripted_url_errors() {
        let mut http = SimHttp::new();
        assert!(http.get("http://nowhere", Duration::from_secs(1)).is_err());
    }

    #[test]
    fn test_fail_scripting() {
        let http = SimHttp::new();
        http.push("http://x", Scripted::Fail("dns down".into()));
        let mut client = http.clone();
        let err = client.get("http://x", Duration::from_secs(1)).unwrap_err();
        assert!(err.to_string().contains("dns down"));
    }
}
