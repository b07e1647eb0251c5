//! HTTP client for the rule/quality-profile server.

use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::debug;

use crate::engine::storage::{ActiveRule, StoredRule};
use crate::engine::{EngineError, EngineResult, ServerAuth, ServerConfiguration};

/// Page size used for paginated searches.
const PAGE_SIZE: usize = 500;

/// Upper bound on pages fetched by one search.
const MAX_PAGES: usize = 100;

/// Request timeout.
const TIMEOUT: Duration = Duration::from_secs(120);

/// `api/system/status` response.
#[derive(Debug, Deserialize)]
pub struct SystemStatus {
    pub status: String,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RuleParam {
    key: String,
    #[serde(default, rename = "defaultValue")]
    default_value: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Rule {
    key: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    lang: String,
    #[serde(default)]
    severity: String,
    #[serde(default, rename = "htmlDesc")]
    html_desc: String,
    #[serde(default)]
    params: Vec<RuleParam>,
}

#[derive(Debug, Deserialize)]
struct ActiveParam {
    key: String,
    #[serde(default)]
    value: String,
}

#[derive(Debug, Deserialize)]
struct Activation {
    #[serde(default)]
    severity: String,
    #[serde(default)]
    params: Vec<ActiveParam>,
}

#[derive(Debug, Deserialize)]
struct RuleSearchResponse {
    #[serde(default)]
    total: usize,
    #[serde(default)]
    rules: Vec<Rule>,
    #[serde(default)]
    actives: HashMap<String, Vec<Activation>>,
}

/// A quality profile assigned to a project.
#[derive(Debug, Clone, Deserialize)]
pub struct QualityProfile {
    pub key: String,
    #[serde(default)]
    pub language: String,
}

#[derive(Debug, Deserialize)]
struct ProfileSearchResponse {
    #[serde(default)]
    profiles: Vec<QualityProfile>,
}

/// API client for one server connection.
#[derive(Debug, Clone)]
pub struct ServerApi {
    client: Client,
    base_url: String,
    auth: ServerAuth,
}

impl ServerApi {
    /// Create a client for the given server.
    pub fn new(server: &ServerConfiguration) -> EngineResult<Self> {
        let client = Client::builder()
            .user_agent(server.user_agent.clone())
            .timeout(TIMEOUT)
            .build()
            .map_err(|e| EngineError::Other(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: server.url.trim_end_matches('/').to_string(),
            auth: server.auth.clone(),
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url, endpoint)
    }

    fn authenticated(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.auth {
            ServerAuth::Anonymous => builder,
            ServerAuth::Credentials { login, password } => {
                builder.basic_auth(login, Some(password))
            }
            ServerAuth::Token(token) => builder.bearer_auth(token),
        }
    }

    /// Make an authenticated GET request.
    async fn get<R: DeserializeOwned>(&self, endpoint: &str, query: &[(&str, String)]) -> EngineResult<R> {
        let url = self.url(endpoint);
        debug!("GET {} {:?}", url, query);

        let response = self
            .authenticated(self.client.get(&url).query(query))
            .send()
            .await
            .map_err(|e| EngineError::Connection(format!("{}: {}", url, e)))?;

        self.handle_response(&url, response).await
    }

    /// Handle server response, extracting errors.
    async fn handle_response<R: DeserializeOwned>(&self, url: &str, response: Response) -> EngineResult<R> {
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = if body.is_empty() {
                status.canonical_reason().unwrap_or("Unknown").to_string()
            } else {
                body
            };
            return Err(EngineError::Server {
                status: status.as_u16(),
                url: url.to_string(),
                message,
            });
        }

        response.json().await.map_err(|e| EngineError::Server {
            status: status.as_u16(),
            url: url.to_string(),
            message: format!("Failed to parse response: {}", e),
        })
    }

    // ===== API Endpoints =====

    /// Check that the server is up.
    pub async fn system_status(&self) -> EngineResult<SystemStatus> {
        let status: SystemStatus = self.get("api/system/status", &[]).await?;
        if status.status != "UP" {
            return Err(EngineError::Connection(format!(
                "Server {} is not ready (status {})",
                self.base_url, status.status
            )));
        }
        Ok(status)
    }

    /// Fetch every rule of the given languages.
    pub async fn search_rules(&self, languages: &[String]) -> EngineResult<Vec<StoredRule>> {
        let mut rules = Vec::new();

        for page in 1..=MAX_PAGES {
            let query = [
                ("languages", languages.join(",")),
                ("f", "name,lang,severity,htmlDesc,params".to_string()),
                ("ps", PAGE_SIZE.to_string()),
                ("p", page.to_string()),
            ];
            let response: RuleSearchResponse = self.get("api/rules/search", &query).await?;
            let fetched = response.rules.len();

            rules.extend(response.rules.into_iter().map(|rule| StoredRule {
                key: rule.key,
                name: rule.name,
                language: rule.lang,
                severity: rule.severity,
                html_description: rule.html_desc,
                params: rule
                    .params
                    .into_iter()
                    .filter_map(|p| p.default_value.map(|v| (p.key, v)))
                    .collect(),
            }));

            if fetched < PAGE_SIZE || rules.len() >= response.total {
                break;
            }
        }

        Ok(rules)
    }

    /// Quality profiles assigned to a project.
    pub async fn project_profiles(&self, project_key: &str) -> EngineResult<Vec<QualityProfile>> {
        let response: ProfileSearchResponse = self
            .get(
                "api/qualityprofiles/search",
                &[("project", project_key.to_string())],
            )
            .await?;
        Ok(response.profiles)
    }

    /// Rules activated in a quality profile.
    pub async fn active_rules(&self, profile_key: &str) -> EngineResult<Vec<ActiveRule>> {
        let mut active = Vec::new();

        for page in 1..=MAX_PAGES {
            let query = [
                ("qprofile", profile_key.to_string()),
                ("activation", "true".to_string()),
                ("f", "actives".to_string()),
                ("ps", PAGE_SIZE.to_string()),
                ("p", page.to_string()),
            ];
            let mut response: RuleSearchResponse = self.get("api/rules/search", &query).await?;
            let fetched = response.rules.len();

            for rule in response.rules {
                let activation = response
                    .actives
                    .remove(&rule.key)
                    .and_then(|mut list| list.pop());
                let (severity, params) = match activation {
                    Some(a) => (
                        a.severity,
                        a.params
                            .into_iter()
                            .map(|p| (p.key, p.value))
                            .collect::<BTreeMap<_, _>>(),
                    ),
                    None => (rule.severity, BTreeMap::new()),
                };
                active.push(ActiveRule {
                    rule_key: rule.key,
                    severity,
                    params,
                });
            }

            if fetched < PAGE_SIZE || active.len() >= response.total {
                break;
            }
        }

        Ok(active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_is_normalized() {
        let api = ServerApi::new(&ServerConfiguration::new("http://localhost:9000/")).unwrap();
        assert_eq!(api.url("api/system/status"), "http://localhost:9000/api/system/status");
    }

    #[test]
    fn test_rule_search_response_parsing() {
        let json = r#"{
            "total": 1, "p": 1, "ps": 500,
            "rules": [{
                "key": "js:S1", "name": "No eval", "lang": "js", "severity": "MAJOR",
                "htmlDesc": "<p>Avoid eval</p>",
                "params": [{"key": "regularExpression", "defaultValue": "eval\\("}]
            }],
            "actives": {"js:S1": [{"qProfile": "p1", "severity": "BLOCKER", "params": [{"key": "message", "value": "Remove eval"}]}]}
        }"#;

        let response: RuleSearchResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.total, 1);
        assert_eq!(response.rules[0].html_desc, "<p>Avoid eval</p>");
        assert_eq!(
            response.rules[0].params[0].default_value.as_deref(),
            Some("eval\\(")
        );
        assert_eq!(response.actives["js:S1"][0].severity, "BLOCKER");
    }

    #[tokio::test]
    async fn test_unreachable_server_is_connection_error() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let url = format!("http://127.0.0.1:{}", port);
        let api = ServerApi::new(&ServerConfiguration::new(url)).unwrap();
        let result = api.system_status().await;
        assert!(matches!(result, Err(EngineError::Connection(_))));
    }
}
