//! Internet egress RPC
//!
//! A sender wraps `(url, payload)` in a GatewayData package and unicasts
//! it to its selected bridge; the bridge runs pre-flight checks, executes
//! the HTTP request, and unicasts a GatewayAck back. The sender classifies
//! the ack and either resolves the user callback or retries with
//! exponential backoff until its attempt budget or deadline runs out.
//!
//! Pre-flight failures are terminal by construction: retrying through the
//! same dead uplink cannot help, so each carries a fixed error string the
//! sender recognises as non-retryable.

use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use canopy_core::{
    GatewayAckPackage, GatewayDataPackage, HttpClient, NodeId, Routing,
};

/// Pre-flight failure: the bridge's station link is down
pub const ERR_WIFI: &str = "Gateway WiFi not connected";
/// Pre-flight failure: the router answers but nothing resolves behind it
pub const ERR_NO_INTERNET: &str = "Router has no internet access";
/// Pre-flight failure: a captive portal intercepts HTTP
pub const ERR_CAPTIVE_PORTAL: &str =
    "Captive portal detected - requires web authentication. Check router/WiFi settings";
/// Sweeper resolution for requests past their deadline
pub const ERR_TIMED_OUT: &str = "Request timed out";

/// HTTP statuses treated as success end-to-end
pub const SUCCESS_STATUSES: [u16; 4] = [200, 201, 202, 204];

fn is_non_retryable_error(error: &str) -> bool {
    matches!(error, ERR_WIFI | ERR_NO_INTERNET | ERR_CAPTIVE_PORTAL)
}

/// Classification of one ack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckClass {
    Success,
    Retryable,
    Fatal,
}

/// Classify an ack by status and error string
///
/// 203 is a proxied/cached response and treated as transient, as are 429
/// and every 5xx. Status 0 means the request never completed; it is
/// retryable unless the error names a gateway-infrastructure condition.
pub fn classify(http_status: u16, error: Option<&str>) -> AckClass {
    match http_status {
        s if SUCCESS_STATUSES.contains(&s) => AckClass::Success,
        203 | 429 => AckClass::Retryable,
        500..=599 => AckClass::Retryable,
        0 => match error {
            Some(e) if is_non_retryable_error(e) => AckClass::Fatal,
            _ => AckClass::Retryable,
        },
        _ => AckClass::Fatal,
    }
}

/// Final result handed to the user callback, exactly once per request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayOutcome {
    pub message_id: u64,
    pub success: bool,
    pub http_status: u16,
    pub error: Option<String>,
}

/// User callback invoked when a request resolves
pub type GatewayCallback = Box<dyn FnMut(&GatewayOutcome)>;

/// Per-request knobs
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub deadline: Duration,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_secs(2),
            deadline: Duration::from_secs(30),
        }
    }
}

struct PendingRequest {
    message_id: u64,
    gateway: NodeId,
    url: String,
    payload: Value,
    attempts_used: u32,
    max_attempts: u32,
    backoff_base_us: u64,
    deadline_us: u64,
    /// `Some` while waiting out a backoff before the next attempt
    retry_at_us: Option<u64>,
    callback: GatewayCallback,
}

impl PendingRequest {
    fn to_package(&self, self_id: NodeId, now_us: u64) -> GatewayDataPackage {
        GatewayDataPackage {
            from: self_id,
            dest: self.gateway,
            routing: Routing::Single,
            message_id: self.message_id,
            url: self.url.clone(),
            payload: self.payload.clone(),
            max_attempts: self.max_attempts,
            backoff_base_ms: self.backoff_base_us / 1000,
            deadline_ms: self.deadline_us.saturating_sub(now_us) / 1000,
        }
    }
}

/// What happened to a request after an ack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDisposition {
    /// Callback fired; request removed
    Resolved { success: bool },
    /// Another attempt will go out at the given time
    RetryScheduled { at_us: u64 },
    /// No pending request matches the ack
    Unknown,
}

/// Sender-side request tracking
#[derive(Default)]
pub struct GatewaySender {
    pending: Vec<PendingRequest>,
    next_message_id: u64,
}

impl GatewaySender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Register a request and build its first attempt
    pub fn create(
        &mut self,
        now_us: u64,
        self_id: NodeId,
        gateway: NodeId,
        url: String,
        payload: Value,
        opts: RequestOptions,
        callback: GatewayCallback,
    ) -> GatewayDataPackage {
        self.next_message_id += 1;
        let request = PendingRequest {
            message_id: self.next_message_id,
            gateway,
            url,
            payload,
            attempts_used: 1,
            max_attempts: opts.max_attempts.max(1),
            backoff_base_us: opts.backoff_base.as_micros() as u64,
            deadline_us: now_us + opts.deadline.as_micros() as u64,
            retry_at_us: None,
            callback,
        };
        let pkg = request.to_package(self_id, now_us);
        debug!(message_id = request.message_id, gateway = %gateway, "gateway request created");
        self.pending.push(request);
        pkg
    }

    /// Process an ack from the bridge
    pub fn on_ack(&mut self, ack: &GatewayAckPackage, now_us: u64) -> AckDisposition {
        let Some(idx) = self
            .pending
            .iter()
            .position(|r| r.message_id == ack.message_id)
        else {
            debug!(message_id = ack.message_id, "ack for unknown request");
            return AckDisposition::Unknown;
        };

        match classify(ack.http_status, ack.error.as_deref()) {
            AckClass::Success => {
                self.resolve(
                    idx,
                    GatewayOutcome {
                        message_id: ack.message_id,
                        success: true,
                        http_status: ack.http_status,
                        error: None,
                    },
                );
                AckDisposition::Resolved { success: true }
            }
            AckClass::Fatal => {
                self.resolve(
                    idx,
                    GatewayOutcome {
                        message_id: ack.message_id,
                        success: false,
                        http_status: ack.http_status,
                        error: ack.error.clone(),
                    },
                );
                AckDisposition::Resolved { success: false }
            }
            AckClass::Retryable => {
                let request = &mut self.pending[idx];
                let backoff_us = request
                    .backoff_base_us
                    .saturating_mul(1u64 << (request.attempts_used - 1).min(16));
                let at_us = now_us + backoff_us;
                if request.attempts_used >= request.max_attempts || at_us > request.deadline_us {
                    let outcome = GatewayOutcome {
                        message_id: ack.message_id,
                        success: false,
                        http_status: ack.http_status,
                        error: ack.error.clone(),
                    };
                    self.resolve(idx, outcome);
                    return AckDisposition::Resolved { success: false };
                }
                info!(
                    message_id = ack.message_id,
                    http_status = ack.http_status,
                    at_us,
                    "transient gateway failure, retry scheduled"
                );
                request.retry_at_us = Some(at_us);
                AckDisposition::RetryScheduled { at_us }
            }
        }
    }

    /// Collect attempts whose backoff has elapsed
    ///
    /// With no active mesh connections the attempt is pushed back instead
    /// of dispatched, and its budget is not consumed.
    pub fn due_retries(
        &mut self,
        now_us: u64,
        self_id: NodeId,
        mesh_connected: bool,
    ) -> Vec<GatewayDataPackage> {
        let mut out = Vec::new();
        for request in &mut self.pending {
            let Some(at_us) = request.retry_at_us else {
                continue;
            };
            if at_us > now_us {
                continue;
            }
            if !mesh_connected {
                request.retry_at_us = Some(now_us + request.backoff_base_us);
                debug!(
                    message_id = request.message_id,
                    "mesh disconnected, retry deferred without consuming budget"
                );
                continue;
            }
            request.attempts_used += 1;
            request.retry_at_us = None;
            out.push(request.to_package(self_id, now_us));
        }
        out
    }

    /// Fail every request whose deadline has elapsed
    pub fn sweep(&mut self, now_us: u64) -> usize {
        let mut expired = 0;
        let mut idx = 0;
        while idx < self.pending.len() {
            if now_us > self.pending[idx].deadline_us {
                let message_id = self.pending[idx].message_id;
                warn!(message_id, "gateway request timed out");
                self.resolve(
                    idx,
                    GatewayOutcome {
                        message_id,
                        success: false,
                        http_status: 0,
                        error: Some(ERR_TIMED_OUT.into()),
                    },
                );
                expired += 1;
            } else {
                idx += 1;
            }
        }
        expired
    }

    /// Fail every outstanding request (for `stop()`)
    pub fn fail_all(&mut self, error: &str) {
        while !self.pending.is_empty() {
            let message_id = self.pending[0].message_id;
            self.resolve(
                0,
                GatewayOutcome {
                    message_id,
                    success: false,
                    http_status: 0,
                    error: Some(error.into()),
                },
            );
        }
    }

    fn resolve(&mut self, idx: usize, outcome: GatewayOutcome) {
        let mut request = self.pending.remove(idx);
        (request.callback)(&outcome);
    }
}

/// Bridge-side configuration for serving gateway requests
#[derive(Debug, Clone)]
pub struct GatewayServerConfig {
    /// Fetched to prove name resolution and routed internet
    pub connectivity_probe_url: String,
    /// Fetched and compared byte-for-byte against the expected body
    pub captive_probe_url: String,
    pub captive_expected_body: String,
    pub http_timeout: Duration,
}

impl Default for GatewayServerConfig {
    fn default() -> Self {
        Self {
            connectivity_probe_url: "http://www.msftconnecttest.com/connecttest.txt".into(),
            captive_probe_url: "http://www.msftconnecttest.com/connecttest.txt".into(),
            captive_expected_body: "Microsoft Connect Test".into(),
            http_timeout: Duration::from_secs(10),
        }
    }
}

fn ack(req: &GatewayDataPackage, self_id: NodeId, success: bool, status: u16, error: Option<String>) -> GatewayAckPackage {
    GatewayAckPackage {
        from: self_id,
        dest: req.from,
        routing: Routing::Single,
        message_id: req.message_id,
        success,
        http_status: status,
        error,
    }
}

/// Execute one gateway request on the bridge
///
/// Pre-flight order: station WiFi, connectivity probe, captive-portal
/// probe; each failure acks immediately with its non-retryable error
/// string. The caller pauses connection idle timeouts around this call —
/// the HTTP exchange can outlast a link-idle window.
pub fn serve_gateway_request<H: HttpClient>(
    http: &mut H,
    config: &GatewayServerConfig,
    wifi_associated: bool,
    req: &GatewayDataPackage,
    self_id: NodeId,
) -> GatewayAckPackage {
    if !wifi_associated {
        return ack(req, self_id, false, 0, Some(ERR_WIFI.into()));
    }

    if http
        .get(&config.connectivity_probe_url, config.http_timeout)
        .is_err()
    {
        return ack(req, self_id, false, 0, Some(ERR_NO_INTERNET.into()));
    }

    match http.get(&config.captive_probe_url, config.http_timeout) {
        Err(_) => return ack(req, self_id, false, 0, Some(ERR_NO_INTERNET.into())),
        Ok(resp) if resp.body != config.captive_expected_body => {
            info!(status = resp.status, "captive portal detected");
            return ack(req, self_id, false, 0, Some(ERR_CAPTIVE_PORTAL.into()));
        }
        Ok(_) => {}
    }

    let result = match &req.payload {
        Value::Null => http.get(&req.url, config.http_timeout),
        Value::String(s) if s.is_empty() => http.get(&req.url, config.http_timeout),
        Value::String(s) => http.post(&req.url, s, config.http_timeout),
        other => {
            let body = other.to_string();
            http.post(&req.url, &body, config.http_timeout)
        }
    };

    match result {
        Ok(resp) => ack(
            req,
            self_id,
            SUCCESS_STATUSES.contains(&resp.status),
            resp.status,
            None,
        ),
        Err(e) => ack(req, self_id, false, 0, Some(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    use canopy_core::{GatewayError, HttpResponse};

    #[test]
    fn test_classify() {
        assert_eq!(classify(200, None), AckClass::Success);
        assert_eq!(classify(204, None), AckClass::Success);
        assert_eq!(classify(203, None), AckClass::Retryable);
        assert_eq!(classify(429, None), AckClass::Retryable);
        assert_eq!(classify(503, None), AckClass::Retryable);
        assert_eq!(classify(301, None), AckClass::Fatal);
        assert_eq!(classify(404, None), AckClass::Fatal);
        assert_eq!(classify(0, Some("connection reset")), AckClass::Retryable);
        assert_eq!(classify(0, Some(ERR_WIFI)), AckClass::Fatal);
        assert_eq!(classify(0, Some(ERR_NO_INTERNET)), AckClass::Fatal);
        assert_eq!(classify(0, Some(ERR_CAPTIVE_PORTAL)), AckClass::Fatal);
    }

    fn outcome_sink() -> (Rc<RefCell<Vec<GatewayOutcome>>>, GatewayCallback) {
        let sink = Rc::new(RefCell::new(Vec::new()));
        let writer = Rc::clone(&sink);
        (
            sink,
            Box::new(move |outcome: &GatewayOutcome| {
                writer.borrow_mut().push(outcome.clone());
            }),
        )
    }

    fn ack_pkg(message_id: u64, status: u16, error: Option<&str>) -> GatewayAckPackage {
        GatewayAckPackage {
            from: NodeId(5),
            dest: NodeId(9),
            routing: Routing::Single,
            message_id,
            success: SUCCESS_STATUSES.contains(&status),
            http_status: status,
            error: error.map(String::from),
        }
    }

    #[test]
    fn test_success_resolves_once() {
        let mut sender = GatewaySender::new();
        let (sink, cb) = outcome_sink();
        let pkg = sender.create(
            0,
            NodeId(9),
            NodeId(5),
            "https://api.example/ok".into(),
            Value::Null,
            RequestOptions::default(),
            cb,
        );

        assert_eq!(
            sender.on_ack(&ack_pkg(pkg.message_id, 200, None), 1_000),
            AckDisposition::Resolved { success: true }
        );
        assert!(sender.is_empty());
        assert_eq!(sink.borrow().len(), 1);
        assert!(sink.borrow()[0].success);

        // A late duplicate ack is ignored.
        assert_eq!(
            sender.on_ack(&ack_pkg(pkg.message_id, 200, None), 2_000),
            AckDisposition::Unknown
        );
        assert_eq!(sink.borrow().len(), 1);
    }

    #[test]
    fn test_non_retryable_never_retries() {
        let mut sender = GatewaySender::new();
        let (sink, cb) = outcome_sink();
        let pkg = sender.create(
            0,
            NodeId(9),
            NodeId(5),
            "https://api.example/ok".into(),
            Value::String(String::new()),
            RequestOptions::default(),
            cb,
        );

        let disposition =
            sender.on_ack(&ack_pkg(pkg.message_id, 0, Some(ERR_CAPTIVE_PORTAL)), 1_000);
        assert_eq!(disposition, AckDisposition::Resolved { success: false });
        assert!(sender.is_empty());

        let outcomes = sink.borrow();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].http_status, 0);
        assert_eq!(outcomes[0].error.as_deref(), Some(ERR_CAPTIVE_PORTAL));
        // No retry anywhere in the pipeline.
        drop(outcomes);
        assert!(sender.due_retries(u64::MAX, NodeId(9), true).is_empty());
    }

    #[test]
    fn test_retryable_backs_off_exponentially() {
        let mut sender = GatewaySender::new();
        let (sink, cb) = outcome_sink();
        let pkg = sender.create(
            0,
            NodeId(9),
            NodeId(5),
            "https://api.example/ok".into(),
            Value::Null,
            RequestOptions {
                max_attempts: 3,
                backoff_base: Duration::from_secs(2),
                deadline: Duration::from_secs(30),
            },
            cb,
        );

        // First 203: retry after 2s.
        let d = sender.on_ack(&ack_pkg(pkg.message_id, 203, None), 0);
        assert_eq!(d, AckDisposition::RetryScheduled { at_us: 2_000_000 });
        assert!(sender.due_retries(1_999_999, NodeId(9), true).is_empty());
        let retries = sender.due_retries(2_000_000, NodeId(9), true);
        assert_eq!(retries.len(), 1);

        // Second 203: retry after 4s more.
        let d = sender.on_ack(&ack_pkg(pkg.message_id, 203, None), 2_100_000);
        assert_eq!(d, AckDisposition::RetryScheduled { at_us: 6_100_000 });
        let retries = sender.due_retries(6_100_000, NodeId(9), true);
        assert_eq!(retries.len(), 1);

        // Third answers 200: resolved.
        let d = sender.on_ack(&ack_pkg(pkg.message_id, 200, None), 6_200_000);
        assert_eq!(d, AckDisposition::Resolved { success: true });
        assert!(sink.borrow()[0].success);
    }

    #[test]
    fn test_attempt_budget_exhausts() {
        let mut sender = GatewaySender::new();
        let (sink, cb) = outcome_sink();
        let pkg = sender.create(
            0,
            NodeId(9),
            NodeId(5),
            "https://api.example/ok".into(),
            Value::Null,
            RequestOptions {
                max_attempts: 2,
                backoff_base: Duration::from_secs(1),
                deadline: Duration::from_secs(60),
            },
            cb,
        );

        sender.on_ack(&ack_pkg(pkg.message_id, 500, None), 0);
        sender.due_retries(1_000_000, NodeId(9), true);
        // Second failed attempt was the last of the budget.
        let d = sender.on_ack(&ack_pkg(pkg.message_id, 500, None), 1_100_000);
        assert_eq!(d, AckDisposition::Resolved { success: false });
        assert_eq!(sink.borrow()[0].http_status, 500);
    }

    #[test]
    fn test_retry_deferred_while_mesh_disconnected() {
        let mut sender = GatewaySender::new();
        let (_sink, cb) = outcome_sink();
        let pkg = sender.create(
            0,
            NodeId(9),
            NodeId(5),
            "https://api.example/ok".into(),
            Value::Null,
            RequestOptions::default(),
            cb,
        );
        sender.on_ack(&ack_pkg(pkg.message_id, 503, None), 0);

        // Mesh down at retry time: deferred, budget intact.
        assert!(sender.due_retries(2_000_000, NodeId(9), false).is_empty());
        let retries = sender.due_retries(4_000_000, NodeId(9), true);
        assert_eq!(retries.len(), 1);
        assert_eq!(retries[0].message_id, pkg.message_id);
    }

    #[test]
    fn test_sweep_times_out_by_deadline() {
        let mut sender = GatewaySender::new();
        let (sink, cb) = outcome_sink();
        sender.create(
            0,
            NodeId(9),
            NodeId(5),
            "https://api.example/ok".into(),
            Value::Null,
            RequestOptions {
                deadline: Duration::from_secs(5),
                ..RequestOptions::default()
            },
            cb,
        );

        assert_eq!(sender.sweep(5_000_000), 0);
        assert_eq!(sender.sweep(5_000_001), 1);
        let outcomes = sink.borrow();
        assert_eq!(outcomes[0].error.as_deref(), Some(ERR_TIMED_OUT));
        assert_eq!(outcomes[0].http_status, 0);
    }

    /// HTTP double that answers from a scripted queue
    struct ScriptedHttp {
        responses: VecDeque<Result<HttpResponse, GatewayError>>,
        requests: Vec<String>,
    }

    impl ScriptedHttp {
        fn new(responses: Vec<Result<HttpResponse, GatewayError>>) -> Self {
            Self {
                responses: responses.into(),
                requests: Vec::new(),
            }
        }

        fn next(&mut self, url: &str) -> Result<HttpResponse, GatewayError> {
            self.requests.push(url.to_string());
            self.responses
                .pop_front()
                .unwrap_or(Err(GatewayError::Http("script exhausted".into())))
        }
    }

    impl HttpClient for ScriptedHttp {
        fn get(&mut self, url: &str, _t: Duration) -> Result<HttpResponse, GatewayError> {
            self.next(url)
        }

        fn post(&mut self, url: &str, _b: &str, _t: Duration) -> Result<HttpResponse, GatewayError> {
            self.next(url)
        }
    }

    fn request() -> GatewayDataPackage {
        GatewayDataPackage {
            from: NodeId(9),
            dest: NodeId(5),
            routing: Routing::Single,
            message_id: 1,
            url: "https://api.example/ok".into(),
            payload: Value::String(String::new()),
            max_attempts: 3,
            backoff_base_ms: 2000,
            deadline_ms: 30_000,
        }
    }

    fn probe_ok() -> Result<HttpResponse, GatewayError> {
        Ok(HttpResponse {
            status: 200,
            body: "Microsoft Connect Test".into(),
        })
    }

    #[test]
    fn test_serve_wifi_down() {
        let mut http = ScriptedHttp::new(vec![]);
        let ack =
            serve_gateway_request(&mut http, &GatewayServerConfig::default(), false, &request(), NodeId(5));
        assert!(!ack.success);
        assert_eq!(ack.http_status, 0);
        assert_eq!(ack.error.as_deref(), Some(ERR_WIFI));
        assert!(http.requests.is_empty());
    }

    #[test]
    fn test_serve_no_internet() {
        let mut http = ScriptedHttp::new(vec![Err(GatewayError::Http("dns failure".into()))]);
        let ack =
            serve_gateway_request(&mut http, &GatewayServerConfig::default(), true, &request(), NodeId(5));
        assert_eq!(ack.error.as_deref(), Some(ERR_NO_INTERNET));
    }

    #[test]
    fn test_serve_captive_portal() {
        // Portal answers the probe with a login page.
        let mut http = ScriptedHttp::new(vec![
            probe_ok(),
            Ok(HttpResponse {
                status: 302,
                body: "<login>".into(),
            }),
        ]);
        let ack =
            serve_gateway_request(&mut http, &GatewayServerConfig::default(), true, &request(), NodeId(5));
        assert!(!ack.success);
        assert_eq!(ack.http_status, 0);
        assert_eq!(ack.error.as_deref(), Some(ERR_CAPTIVE_PORTAL));
    }

    #[test]
    fn test_serve_executes_request_after_preflight() {
        let mut http = ScriptedHttp::new(vec![
            probe_ok(),
            probe_ok(),
            Ok(HttpResponse {
                status: 200,
                body: "ok".into(),
            }),
        ]);
        let ack =
            serve_gateway_request(&mut http, &GatewayServerConfig::default(), true, &request(), NodeId(5));
        assert!(ack.success);
        assert_eq!(ack.http_status, 200);
        assert_eq!(http.requests.len(), 3);
        assert_eq!(http.requests[2], "https://api.example/ok");
        assert_eq!(ack.dest, NodeId(9));
    }

    #[test]
    fn test_serve_reports_http_status_verbatim() {
        let mut http = ScriptedHttp::new(vec![
            probe_ok(),
            probe_ok(),
            Ok(HttpResponse {
                status: 203,
                body: "cached".into(),
            }),
        ]);
        let ack =
            serve_gateway_request(&mut http, &GatewayServerConfig::default(), true, &request(), NodeId(5));
        assert!(!ack.success);
        assert_eq!(ack.http_status, 203);
        assert_eq!(ack.error, None);
    }
}
