//! Connection URL construction.
//!
//! Turns [`ConnectionSettings`] into a driver connection string. The rendered
//! form carries a `+driver` token (`postgresql+asyncpg://...`) so that external
//! tooling can pick the matching client library; [`ConnectionUrl::driver_url`]
//! strips it again for the native driver.

use crate::error::{DbError, DbResult};
use crate::models::{ConnectionSettings, DatabaseKind, DriverMode};
use url::Url;

const MASK: &str = "****";

/// A rendered connection string for one driver mode.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionUrl {
    kind: DatabaseKind,
    mode: DriverMode,
    url: Url,
}

impl ConnectionUrl {
    pub fn kind(&self) -> DatabaseKind {
        self.kind
    }

    pub fn mode(&self) -> DriverMode {
        self.mode
    }

    /// The full URL including credentials. Do not log.
    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }

    pub fn driver_token(&self) -> &'static str {
        self.kind.driver_token(self.mode)
    }

    /// The URL with the password replaced by `****`.
    pub fn masked(&self) -> String {
        if self.url.password().is_none() {
            return self.url.to_string();
        }
        let mut masked = self.url.clone();
        // A URL that already has credentials always accepts a new password.
        let _ = masked.set_password(Some(MASK));
        masked.to_string()
    }

    /// The URL in the form the native driver expects: `postgres://` or `mysql://`.
    pub fn driver_url(&self) -> String {
        let rendered = self.url.as_str();
        match rendered.split_once("://") {
            Some((_, rest)) => format!("{}://{}", self.kind.driver_scheme(), rest),
            None => rendered.to_string(),
        }
    }
}

impl std::fmt::Debug for ConnectionUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionUrl")
            .field("kind", &self.kind)
            .field("mode", &self.mode)
            .field("url", &self.masked())
            .finish()
    }
}

impl std::fmt::Display for ConnectionUrl {
    /// Displays the masked form.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.masked())
    }
}

/// Render the connection URL for `settings` in the given driver mode.
///
/// Deterministic: the same settings always produce the same string. Username
/// and password are percent-encoded. MySQL URLs always carry the charset as
/// their first query parameter.
pub fn build(settings: &ConnectionSettings, mode: DriverMode) -> DbResult<ConnectionUrl> {
    let kind = settings.kind;
    let host = settings.host.trim();
    if host.is_empty() {
        return Err(DbError::invalid_configuration("host is required"));
    }
    let host = if host.contains(':') && !host.starts_with('[') {
        format!("[{}]", host)
    } else {
        host.to_string()
    };

    let base = format!("{}+{}://{}", kind.scheme(), kind.driver_token(mode), host);
    let mut url = Url::parse(&base).map_err(|e| {
        DbError::invalid_configuration(format!("Cannot form a URL from host '{}': {}", host, e))
    })?;

    let cannot_set = |what: &str| DbError::invalid_configuration(format!("Cannot set {what} on URL"));
    url.set_port(Some(settings.port))
        .map_err(|_| cannot_set("port"))?;
    if !settings.username.is_empty() {
        url.set_username(&settings.username)
            .map_err(|_| cannot_set("username"))?;
    }
    if !settings.password.is_empty() {
        url.set_password(Some(&settings.password))
            .map_err(|_| cannot_set("password"))?;
    }
    url.set_path(&format!("/{}", settings.database));

    let has_query = kind == DatabaseKind::MySQL || !settings.extra_options.is_empty();
    if has_query {
        let mut query = url.query_pairs_mut();
        if kind == DatabaseKind::MySQL {
            query.append_pair("charset", settings.pool_options.charset_or_default());
        }
        for (key, value) in &settings.extra_options {
            query.append_pair(key, value);
        }
    }

    Ok(ConnectionUrl { kind, mode, url })
}

/// Render both the sync and the async URL.
pub fn build_pair(settings: &ConnectionSettings) -> DbResult<(ConnectionUrl, ConnectionUrl)> {
    Ok((
        build(settings, DriverMode::Sync)?,
        build(settings, DriverMode::Async)?,
    ))
}
