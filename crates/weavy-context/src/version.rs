//! Client/environment version compatibility.

use tracing::{debug, warn};

use crate::context::{VERSION, WeavyContext};
use crate::error::{HttpError, VersionError, WeavyError};
use crate::network::ServerState;

/// `major.minor` of a semver-ish string, ignoring a leading `v` and any
/// pre-release or build suffix.
fn major_minor(version: &str) -> Result<(u64, u64), VersionError> {
    let malformed = || VersionError::Malformed(version.to_string());
    let core = version
        .trim()
        .trim_start_matches('v')
        .split(['-', '+'])
        .next()
        .ok_or_else(malformed)?;

    let mut parts = core.split('.');
    let major = parts
        .next()
        .and_then(|p| p.parse().ok())
        .ok_or_else(malformed)?;
    let minor = parts
        .next()
        .and_then(|p| p.parse().ok())
        .ok_or_else(malformed)?;
    Ok((major, minor))
}

/// Compares client and server versions.
///
/// A major mismatch is an error. A minor mismatch only logs a warning.
pub fn compare_versions(client: &str, server: &str) -> Result<(), VersionError> {
    let (client_major, client_minor) = major_minor(client)?;
    let (server_major, server_minor) = major_minor(server)?;

    if client_major != server_major {
        return Err(VersionError::Mismatch {
            client: client.to_string(),
            server: server.to_string(),
        });
    }
    if client_minor != server_minor {
        warn!(client, server, "client and environment minor versions differ");
    }
    Ok(())
}

impl WeavyContext {
    /// Checks `version` (this package by default) against the environment.
    ///
    /// An unreachable `/version` endpoint marks the server unreachable and is
    /// otherwise ignored.
    pub async fn check_version(&self, version: Option<&str>) -> Result<(), WeavyError> {
        let headers = self.fetch_options(false).await?;
        self.inner.gates.session_ready.wait().await?;
        self.ensure_alive()?;

        let client_version = version.unwrap_or(VERSION);
        let url = self.resolve_url("/version")?;
        let response = self.inner.http.get(url.clone()).headers(headers).send().await;

        let server_version = match response {
            Ok(response) if response.status().is_success() => response.text().await,
            Ok(response) => {
                let error = HttpError::Status {
                    url: url.to_string(),
                    status: response.status().as_u16(),
                };
                warn!(%error, "could not check environment version");
                self.inner.network.set_server_state(ServerState::Unreachable);
                return Ok(());
            }
            Err(error) => Err(error),
        };
        let server_version = match server_version {
            Ok(version) => version,
            Err(error) => {
                warn!(%url, %error, "could not check environment version");
                self.inner.network.set_server_state(ServerState::Unreachable);
                return Ok(());
            }
        };

        debug!(client = client_version, server = %server_version.trim(), "checking environment version");
        compare_versions(client_version, server_version.trim())?;
        Ok(())
    }

    /// Runs a version check in the background, logging the outcome.
    pub(crate) fn spawn_version_check(&self) {
        let context = self.clone();
        self.spawn_tracked(async move {
            if let Err(error) = context.check_version(None).await
                && !error.is_destroyed()
            {
                warn!(%error, "environment version check failed");
            }
        });
    }
}
