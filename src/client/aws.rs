//! EC2 instance metadata lookups.
//!
//! # Responsibilities
//! - Fetch the instance id and availability zone from the metadata service
//! - Read the region out of the instance identity document
//! - Assemble an `AppInfo` (app id, environment, data center, instance id)
//!
//! # Design Decisions
//! - Lookups never fail: any error is logged and `UNKNOWN_VALUE` is returned
//! - Requests are dispatched when the lookup is called, not when it is awaited
//! - "local" environments never touch the metadata service

use std::future::Future;

use serde::Serialize;

use crate::client::error::{BoxError, CallError};
use crate::client::facade::DownstreamClient;
use crate::client::future::CallFuture;
use crate::client::response::DownstreamResponse;

/// Base of the metadata endpoints reachable from an EC2 instance.
pub const METADATA_URL_BASE: &str = "http://169.254.169.254";
/// Plain-text instance id, e.g. `i-abc12d3e`.
pub const INSTANCE_ID_PATH: &str = "/latest/meta-data/instance-id";
/// Plain-text availability zone, e.g. `us-west-2b` (not the region).
pub const AVAILABILITY_ZONE_PATH: &str = "/latest/meta-data/placement/availability-zone";
/// JSON identity document; carries `region`, `instanceId`, `availabilityZone` and more.
pub const IDENTITY_DOCUMENT_PATH: &str = "/latest/dynamic/instance-identity/document";

pub const UNKNOWN_VALUE: &str = "unknown";

const LOCAL_ENVIRONMENTS: [&str; 2] = ["local", "compiletimetest"];
const APP_ID_VARS: [&str; 3] = ["APP_ID", "DEPLOYMENT_APPLICATION_ID", "EUREKA_NAME"];
const ENVIRONMENT_VARS: [&str; 2] = ["APP_ENVIRONMENT", "DEPLOYMENT_ENVIRONMENT"];

/// Identity of the running application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppInfo {
    pub app_id: String,
    pub environment: String,
    pub data_center: String,
    pub instance_id: String,
}

impl AppInfo {
    pub fn new(
        app_id: impl Into<String>,
        environment: impl Into<String>,
        data_center: impl Into<String>,
        instance_id: impl Into<String>,
    ) -> Self {
        Self {
            app_id: app_id.into(),
            environment: environment.into(),
            data_center: data_center.into(),
            instance_id: instance_id.into(),
        }
    }

    /// Info for a developer box: environment and data center are "local",
    /// the instance id is the host name.
    pub fn local(app_id: impl Into<String>) -> Self {
        Self::new(app_id, "local", "local", local_hostname())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AppInfoError {
    #[error("unable to detect app id; set APP_ID, DEPLOYMENT_APPLICATION_ID or EUREKA_NAME, or pass it explicitly")]
    UndetectableAppId,

    #[error("unable to detect environment; set APP_ENVIRONMENT or DEPLOYMENT_ENVIRONMENT, or pass it explicitly")]
    UndetectableEnvironment,
}

/// Instance metadata client built on a `DownstreamClient`.
pub struct AwsMetadata<'a> {
    client: &'a DownstreamClient,
    base_url: String,
}

impl<'a> AwsMetadata<'a> {
    pub fn new(client: &'a DownstreamClient) -> Self {
        Self::with_base_url(client, METADATA_URL_BASE)
    }

    /// Point the lookups somewhere other than the link-local metadata address.
    pub fn with_base_url(client: &'a DownstreamClient, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Id of the instance this process runs on, or `UNKNOWN_VALUE`.
    pub fn instance_id(&self) -> impl Future<Output = String> + Send + 'static {
        let call = self.fetch(INSTANCE_ID_PATH, plain_text);
        async move { or_unknown(call.await, "instance id") }
    }

    /// Availability zone (e.g. `us-west-2b`), or `UNKNOWN_VALUE`.
    pub fn availability_zone(&self) -> impl Future<Output = String> + Send + 'static {
        let call = self.fetch(AVAILABILITY_ZONE_PATH, plain_text);
        async move { or_unknown(call.await, "availability zone") }
    }

    /// Region (e.g. `us-west-2`) from the identity document, or `UNKNOWN_VALUE`.
    pub fn region(&self) -> impl Future<Output = String> + Send + 'static {
        let call = self.fetch(IDENTITY_DOCUMENT_PATH, |response| {
            Ok(region_from_document(&response))
        });
        async move { or_unknown(call.await, "region") }
    }

    /// `AppInfo` for `app_id` in `environment`.
    ///
    /// Local environments get `AppInfo::local` without any lookups. Otherwise the
    /// region becomes the data center; an unknown instance id falls back to the
    /// host name.
    pub fn app_info(
        &self,
        app_id: impl Into<String>,
        environment: impl Into<String>,
    ) -> impl Future<Output = AppInfo> + Send + 'static {
        let app_id = app_id.into();
        let environment = environment.into();
        let local = is_local_environment(&environment);
        let lookups = (!local).then(|| (self.region(), self.instance_id()));

        async move {
            let Some((region, instance_id)) = lookups else {
                let info = AppInfo::local(app_id);
                tracing::info!(
                    app_id = %info.app_id,
                    environment = %info.environment,
                    data_center = %info.data_center,
                    instance_id = %info.instance_id,
                    "Local environment; skipping instance metadata"
                );
                return info;
            };

            let (data_center, mut instance_id) = futures_util::future::join(region, instance_id).await;
            if instance_id == UNKNOWN_VALUE {
                instance_id = local_hostname();
            }

            tracing::info!(
                app_id = %app_id,
                environment = %environment,
                data_center = %data_center,
                instance_id = %instance_id,
                "Resolved app info from instance metadata"
            );
            AppInfo::new(app_id, environment, data_center, instance_id)
        }
    }

    /// `app_info` with the app id and environment read from the process environment.
    pub fn detected_app_info(
        &self,
    ) -> Result<impl Future<Output = AppInfo> + Send + 'static, AppInfoError> {
        let lookup = |key: &str| std::env::var(key).ok();
        let app_id = detect_app_id(lookup).ok_or(AppInfoError::UndetectableAppId)?;
        let environment = detect_environment(lookup).ok_or(AppInfoError::UndetectableEnvironment)?;
        Ok(self.app_info(app_id, environment))
    }

    fn fetch<T, F>(&self, path: &str, handler: F) -> CallFuture<T>
    where
        T: Send + 'static,
        F: FnOnce(DownstreamResponse) -> Result<T, BoxError> + Send + 'static,
    {
        match self.client.new_request(format!("{}{}", self.base_url, path), "GET") {
            Ok(request) => self.client.execute(request, handler),
            Err(e) => CallFuture::failed(e),
        }
    }
}

fn plain_text(response: DownstreamResponse) -> Result<String, BoxError> {
    if !response.status().is_success() {
        return Err(format!("metadata service returned {}", response.status()).into());
    }
    Ok(response.text().trim().to_string())
}

/// `region` from an identity document, or `UNKNOWN_VALUE` if it cannot be read.
fn region_from_document(response: &DownstreamResponse) -> String {
    if !response.status().is_success() {
        tracing::error!(status = response.status_code(), "Metadata service refused the identity document");
        return UNKNOWN_VALUE.to_string();
    }

    match response.json::<serde_json::Value>() {
        Ok(document) => match document.get("region").and_then(serde_json::Value::as_str) {
            Some(region) => region.to_string(),
            None => {
                tracing::error!("Identity document has no region; using 'unknown'");
                UNKNOWN_VALUE.to_string()
            }
        },
        Err(e) => {
            tracing::error!(error = %e, "Unable to parse identity document; using 'unknown'");
            UNKNOWN_VALUE.to_string()
        }
    }
}

fn or_unknown(result: Result<String, CallError>, what: &str) -> String {
    match result {
        Ok(value) if !value.is_empty() => value,
        Ok(_) => {
            tracing::error!(what, "Metadata service returned an empty value; using 'unknown'");
            UNKNOWN_VALUE.to_string()
        }
        Err(e) => {
            tracing::error!(what, error = %e, "Unable to read instance metadata; using 'unknown'");
            UNKNOWN_VALUE.to_string()
        }
    }
}

pub fn is_local_environment(environment: &str) -> bool {
    LOCAL_ENVIRONMENTS
        .iter()
        .any(|local| local.eq_ignore_ascii_case(environment))
}

/// First non-empty app id among `APP_ID_VARS`.
pub fn detect_app_id(lookup: impl Fn(&str) -> Option<String>) -> Option<String> {
    first_set(&APP_ID_VARS, lookup)
}

/// First non-empty environment among `ENVIRONMENT_VARS`.
pub fn detect_environment(lookup: impl Fn(&str) -> Option<String>) -> Option<String> {
    first_set(&ENVIRONMENT_VARS, lookup)
}

fn first_set(keys: &[&str], lookup: impl Fn(&str) -> Option<String>) -> Option<String> {
    keys.iter()
        .filter_map(|key| lookup(key))
        .find(|value| !value.trim().is_empty())
}

/// Host name from `HOSTNAME`, then the OS, else `UNKNOWN_VALUE`.
pub fn local_hostname() -> String {
    if let Ok(hostname) = std::env::var("HOSTNAME") {
        if !hostname.is_empty() {
            return hostname;
        }
    }
    system_hostname().unwrap_or_else(|| {
        tracing::warn!("Could not determine host name, using 'unknown'");
        UNKNOWN_VALUE.to_string()
    })
}

#[cfg(unix)]
fn system_hostname() -> Option<String> {
    match nix::unistd::gethostname() {
        Ok(name) => name.into_string().ok().filter(|name| !name.is_empty()),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to get system host name");
            None
        }
    }
}

#[cfg(not(unix))]
fn system_hostname() -> Option<String> {
    None
}
