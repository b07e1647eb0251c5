//! Conversions between wire messages and engine-native values.
//!
//! Everything here is a pure function. Empty strings on the wire mean
//! "not set" and become `None` before reaching the engine.

use encoding_rs::{Encoding, UTF_8};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::engine::{
    self, AnalysisConfiguration, ClientInputFile, GlobalConfiguration, LogLevel, LogOutput,
    ServerAuth, ServerConfiguration,
};
use crate::error::{Error, Result};
use crate::rpc::protocol as wire;

/// Values used when a `register` request leaves a field unset.
#[derive(Debug, Clone)]
pub struct RegistrationDefaults {
    pub home: PathBuf,
    pub languages: Vec<String>,
}

/// `None` for an empty string.
pub fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn non_empty_opt(value: Option<&str>) -> Option<String> {
    value.and_then(non_empty)
}

/// Lowercase, drop blanks and duplicates, keep order.
fn normalize_languages(languages: &[String]) -> Vec<String> {
    let mut normalized: Vec<String> = Vec::with_capacity(languages.len());
    for language in languages {
        let language = language.trim().to_lowercase();
        if !language.is_empty() && !normalized.contains(&language) {
            normalized.push(language);
        }
    }
    normalized
}

// ===== Requests =====

/// Build the engine configuration of a `register` call.
pub fn global_configuration(
    req: &wire::ConnectedConfiguration,
    defaults: &RegistrationDefaults,
    log_output: Arc<dyn LogOutput>,
) -> Result<GlobalConfiguration> {
    let server_id = non_empty(&req.storage_id)
        .ok_or_else(|| Error::InvalidParams("storageId is required".to_string()))?;

    let home = non_empty_opt(req.home_path.as_deref())
        .map(PathBuf::from)
        .unwrap_or_else(|| defaults.home.clone());

    let mut enabled_languages = normalize_languages(&req.enabled_languages);
    if enabled_languages.is_empty() {
        enabled_languages = normalize_languages(&defaults.languages);
    }

    Ok(GlobalConfiguration {
        server_id,
        home,
        enabled_languages,
        log_output,
    })
}

/// Build the engine's view of a server connection.
///
/// The auth variant is chosen by which wire field is set; setting both is
/// rejected.
pub fn server_configuration(config: &wire::ServerConfig) -> Result<ServerConfiguration> {
    let host_url = non_empty(&config.host_url)
        .ok_or_else(|| Error::InvalidServerConfig("hostUrl is required".to_string()))?;
    reqwest::Url::parse(&host_url).map_err(|e| {
        Error::InvalidServerConfig(format!("invalid hostUrl '{}': {}", host_url, e))
    })?;

    let token = non_empty_opt(config.token.as_deref());
    let auth = match (&config.credentials, token) {
        (Some(_), Some(_)) => {
            return Err(Error::InvalidServerConfig(
                "credentials and token are mutually exclusive".to_string(),
            ))
        }
        (Some(credentials), None) => ServerAuth::Credentials {
            login: credentials.login.clone(),
            password: credentials.password.clone(),
        },
        (None, Some(token)) => ServerAuth::Token(token),
        (None, None) => ServerAuth::Anonymous,
    };

    Ok(ServerConfiguration::new(host_url).with_auth(auth))
}

/// Resolve a charset label. An empty label means UTF-8.
pub fn charset(label: &str) -> Result<&'static Encoding> {
    if label.is_empty() {
        return Ok(UTF_8);
    }
    Encoding::for_label(label.trim().as_bytes())
        .ok_or_else(|| Error::UnsupportedCharset(label.to_string()))
}

fn input_file(base_dir: &Path, index: usize, file: &wire::InputFile) -> Result<ClientInputFile> {
    if file.path.is_empty() {
        return Err(Error::InvalidPath(format!("file #{} has an empty path", index)));
    }

    Ok(ClientInputFile {
        path: base_dir.join(&file.path),
        is_test: file.is_test,
        charset: charset(&file.charset)?,
        user_tag: file.user_tag.clone(),
        language: non_empty_opt(file.language.as_deref()),
    })
}

/// Build the engine configuration of an `analyze` call.
pub fn analysis_configuration(req: &wire::ConnectedAnalysisReq) -> Result<AnalysisConfiguration> {
    let base_dir = non_empty(&req.base_dir)
        .map(PathBuf::from)
        .ok_or_else(|| Error::InvalidPath("baseDir is required".to_string()))?;

    let input_files = req
        .files
        .iter()
        .enumerate()
        .map(|(index, file)| input_file(&base_dir, index, file))
        .collect::<Result<Vec<_>>>()?;

    Ok(AnalysisConfiguration {
        project_key: non_empty(&req.module_key),
        base_dir,
        input_files,
        extra_properties: req.properties.clone(),
    })
}

// ===== Responses =====

/// Wire form of a server connection. Inverse of [`server_configuration`].
pub fn server_config(config: &ServerConfiguration) -> wire::ServerConfig {
    let (credentials, token) = match &config.auth {
        ServerAuth::Anonymous => (None, None),
        ServerAuth::Credentials { login, password } => (
            Some(wire::Credentials {
                login: login.clone(),
                password: password.clone(),
            }),
            None,
        ),
        ServerAuth::Token(token) => (None, Some(token.clone())),
    };

    wire::ServerConfig {
        host_url: config.url.clone(),
        credentials,
        token,
    }
}

pub fn storage_state(state: engine::StorageState) -> wire::State {
    match state {
        engine::StorageState::NeverUpdated => wire::State::NeverUpdated,
        engine::StorageState::NeedUpdate => wire::State::NeedUpdate,
        engine::StorageState::Updating => wire::State::Updating,
        engine::StorageState::Updated => wire::State::Updated,
        engine::StorageState::Unknown => wire::State::Unknown,
    }
}

pub fn issue(issue: engine::Issue) -> wire::Issue {
    let (file_path, user_tag) = match issue.input_file {
        Some(file) => (
            Some(file.path.display().to_string()),
            non_empty(&file.user_tag),
        ),
        None => (None, None),
    };

    wire::Issue {
        severity: issue.severity,
        rule_key: issue.rule_key,
        rule_name: issue.rule_name,
        message: issue.message,
        start_line: issue.start_line,
        start_line_offset: issue.start_line_offset,
        end_line: issue.end_line,
        end_line_offset: issue.end_line_offset,
        file_path,
        user_tag,
    }
}

pub fn rule_details(details: engine::RuleDetails) -> wire::RuleDetails {
    wire::RuleDetails {
        key: details.key,
        name: details.name,
        language: details.language,
        severity: details.severity,
        html_description: details.html_description,
    }
}

pub fn log_event(message: &str, level: LogLevel) -> wire::LogEvent {
    wire::LogEvent {
        level: level.as_str().to_string(),
        log: message.to_string(),
        is_debug: level.is_debug(),
    }
}
