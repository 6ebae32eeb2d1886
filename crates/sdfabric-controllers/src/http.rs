//! Shared HTTP plumbing for the controller collaborators: one blocking
//! session per controller with basic auth, connect+read timeouts, pacing
//! after mutations, and the retry discipline for verification reads.

use std::thread;
use std::time::Duration;

use log::warn;
use serde_json::Value;

/// Where a controller lives and how to authenticate against it. An empty
/// username disables basic auth (the sFlow collector is unauthenticated).
#[derive(Debug, Clone, Default)]
pub struct Endpoint {
    pub base_url: String,
    pub username: String,
    pub password: String,
}

/// Session timing knobs. Tests zero the delays.
#[derive(Debug, Clone)]
pub struct SessionOpts {
    /// Connect+read timeout applied to every request.
    pub timeout: Duration,
    /// Sleep after each mutating request, for the controller's commit latency.
    pub mutation_pace: Duration,
    /// GET attempts for operational-state verification.
    pub verify_attempts: u32,
    /// Sleep between verification attempts.
    pub verify_delay: Duration,
}

impl Default for SessionOpts {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            mutation_pace: Duration::from_millis(300),
            verify_attempts: 5,
            verify_delay: Duration::from_secs(1),
        }
    }
}

/// A synchronous HTTP session against one controller.
#[derive(Debug)]
pub struct Session {
    client: reqwest::blocking::Client,
    endpoint: Endpoint,
    opts: SessionOpts,
}

impl Session {
    pub fn new(endpoint: Endpoint) -> Result<Self, ClientError> {
        Self::with_opts(endpoint, SessionOpts::default())
    }

    pub fn with_opts(endpoint: Endpoint, opts: SessionOpts) -> Result<Self, ClientError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(opts.timeout)
            .connect_timeout(opts.timeout)
            .build()?;
        Ok(Self {
            client,
            endpoint,
            opts,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.endpoint.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint.base_url, path)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::blocking::RequestBuilder {
        let mut req = self
            .client
            .request(method, self.url(path))
            .header("Accept", "application/json");
        if !self.endpoint.username.is_empty() {
            req = req.basic_auth(&self.endpoint.username, Some(&self.endpoint.password));
        }
        req
    }

    fn send(
        &self,
        req: reqwest::blocking::RequestBuilder,
        url: &str,
    ) -> Result<reqwest::blocking::Response, ClientError> {
        req.send().map_err(|e| {
            if e.is_timeout() || e.is_connect() {
                ClientError::Unreachable {
                    url: url.to_owned(),
                    source: Some(e),
                }
            } else {
                ClientError::Transport(e)
            }
        })
    }

    fn pace(&self) {
        if !self.opts.mutation_pace.is_zero() {
            thread::sleep(self.opts.mutation_pace);
        }
    }

    /// GET expecting 200 with a JSON body.
    pub fn get_json(&self, path: &str) -> Result<Value, ClientError> {
        self.get_json_opt(path)?
            .ok_or_else(|| ClientError::NotFound(self.url(path)))
    }

    /// GET with 404 mapped to `None`.
    pub fn get_json_opt(&self, path: &str) -> Result<Option<Value>, ClientError> {
        let url = self.url(path);
        let resp = self.send(self.request(reqwest::Method::GET, path), &url)?;
        match resp.status() {
            s if s.is_success() => Ok(Some(resp.json()?)),
            reqwest::StatusCode::NOT_FOUND => Ok(None),
            s if s.is_server_error() => Err(ClientError::Unreachable { url, source: None }),
            s => Err(ClientError::UnexpectedStatus {
                url,
                status: s.as_u16(),
            }),
        }
    }

    /// PUT a JSON document; 200 and 201 are both success. Mutations are paced.
    pub fn put_json(&self, path: &str, body: &Value) -> Result<(), ClientError> {
        let url = self.url(path);
        let resp = self.send(
            self.request(reqwest::Method::PUT, path)
                .header("Content-Type", "application/json")
                .json(body),
            &url,
        )?;
        self.pace();
        self.mutation_status(resp, url)
    }

    /// POST a JSON document; returns the response body when there is one.
    pub fn post_json(&self, path: &str, body: &Value) -> Result<Value, ClientError> {
        let url = self.url(path);
        let resp = self.send(
            self.request(reqwest::Method::POST, path)
                .header("Content-Type", "application/json")
                .json(body),
            &url,
        )?;
        self.pace();
        let status = resp.status();
        if status.is_success() {
            return Ok(resp.json().unwrap_or(Value::Null));
        }
        Err(self.mutation_error(status, url, resp.text().unwrap_or_default()))
    }

    /// DELETE; any non-2xx surfaces as an error for the caller to judge
    /// (teardown paths log and continue). Mutations are paced.
    pub fn delete(&self, path: &str) -> Result<(), ClientError> {
        let url = self.url(path);
        let resp = self.send(self.request(reqwest::Method::DELETE, path), &url)?;
        self.pace();
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        Err(ClientError::UnexpectedStatus {
            url,
            status: status.as_u16(),
        })
    }

    fn mutation_status(
        &self,
        resp: reqwest::blocking::Response,
        url: String,
    ) -> Result<(), ClientError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        Err(self.mutation_error(status, url, resp.text().unwrap_or_default()))
    }

    fn mutation_error(&self, status: reqwest::StatusCode, url: String, body: String) -> ClientError {
        if status.is_server_error() {
            return ClientError::Unreachable { url, source: None };
        }
        ClientError::Conflict { url, body }
    }

    /// GET the operational view of a just-mutated resource, retrying while
    /// the controller commits. Unreachable attempts count against the same
    /// budget as absent state.
    pub fn verify_get(&self, path: &str) -> Result<Value, ClientError> {
        let url = self.url(path);
        for attempt in 1..=self.opts.verify_attempts {
            match self.get_json_opt(path) {
                Ok(Some(value)) => return Ok(value),
                Ok(None) => warn!("operational state at {url} absent (attempt {attempt})"),
                Err(e) => warn!("verification read at {url} failed (attempt {attempt}): {e}"),
            }
            if attempt < self.opts.verify_attempts && !self.opts.verify_delay.is_zero() {
                thread::sleep(self.opts.verify_delay);
            }
        }
        Err(ClientError::VerificationFailed {
            url,
            attempts: self.opts.verify_attempts,
        })
    }
}

/// The collaborator error taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// A referenced resource does not exist.
    #[error("resource not found: {0}")]
    NotFound(String),

    /// The controller timed out or answered 5xx.
    #[error("controller unreachable at {url}")]
    Unreachable {
        /// The request URL.
        url: String,
        /// The transport error, when one was observed.
        #[source]
        source: Option<reqwest::Error>,
    },

    /// A mutation was rejected; the body describes the conflicting resource.
    #[error("mutation rejected at {url}: {body}")]
    Conflict {
        /// The request URL.
        url: String,
        /// The controller's response body.
        body: String,
    },

    /// Operational state never appeared within the retry budget.
    #[error("operational state at {url} still absent after {attempts} attempts")]
    VerificationFailed {
        /// The operational URL probed.
        url: String,
        /// The exhausted attempt budget.
        attempts: u32,
    },

    /// A read returned a status the protocol does not produce.
    #[error("unexpected status {status} from {url}")]
    UnexpectedStatus {
        /// The request URL.
        url: String,
        /// The offending status code.
        status: u16,
    },

    /// A transport-level failure other than timeout/connect.
    #[error("http transport error")]
    Transport(#[from] reqwest::Error),

    /// The response body was not the JSON the protocol promises.
    #[error("malformed response body")]
    Body(#[from] serde_json::Error),
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_get_returns_present_state() -> anyhow::Result<()> {
        let mut server = mockito::Server::new();
        let hit = server
            .mock("GET", "/thing")
            .with_status(200)
            .with_body("{\"ok\": true}")
            .expect(1)
            .create();

        let session = test_support::session(&server);
        let value = session.verify_get("/thing")?;
        assert_eq!(value["ok"], true);
        hit.assert();
        Ok(())
    }

    #[test]
    fn verify_get_exhausts_its_budget() {
        let mut server = mockito::Server::new();
        server
            .mock("GET", "/gone")
            .with_status(404)
            .expect(3)
            .create();

        let session = test_support::session(&server);
        let res = session.verify_get("/gone");
        assert!(matches!(
            res,
            Err(ClientError::VerificationFailed { attempts: 3, .. })
        ));
    }

    #[test]
    fn put_conflict_carries_the_body() {
        let mut server = mockito::Server::new();
        server
            .mock("PUT", "/doc")
            .with_status(409)
            .with_body("already bound")
            .create();

        let session = test_support::session(&server);
        let res = session.put_json("/doc", &serde_json::json!({}));
        match res {
            Err(ClientError::Conflict { body, .. }) => assert_eq!(body, "already bound"),
            other => panic!("expected Conflict, got {other:?}"),
        }
    }

    #[test]
    fn server_errors_read_as_unreachable() {
        let mut server = mockito::Server::new();
        server.mock("GET", "/half-dead").with_status(503).create();
        let session = test_support::session(&server);
        assert!(matches!(
            session.get_json("/half-dead"),
            Err(ClientError::Unreachable { .. })
        ));
    }
}
