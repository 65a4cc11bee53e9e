//! Source settings supplied by the host, decoded into connection settings.

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr, PickFirst};
use std::{collections::HashMap, fmt, str::FromStr};

/// Per-source settings as the host delivers them with every request.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceSettings {
    pub uid: String,
    /// Bumped by the host whenever the settings change.
    #[serde(default)]
    pub updated: i64,
    #[serde(default)]
    pub json_data: serde_json::Value,
    #[serde(default, skip_serializing)]
    pub decrypted_secure_json_data: HashMap<String, String>,
}

/// Identity of one configuration generation of a source.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GenerationKey {
    pub uid: String,
    pub updated: i64,
}

impl fmt::Display for GenerationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.uid, self.updated)
    }
}

impl SourceSettings {
    pub fn generation_key(&self) -> GenerationKey {
        GenerationKey {
            uid: self.uid.clone(),
            updated: self.updated,
        }
    }
}

#[serde_as]
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JsonData {
    #[serde(default)]
    uri: Option<String>,
    #[serde(default)]
    host: Option<String>,
    #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
    port: Option<u16>,
    #[serde(default)]
    database: Option<String>,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    tls_mode: Option<String>,
    #[serde(default, rename = "tlsCACert")]
    tls_ca_cert: Option<String>,
    #[serde(default, rename = "tlsCACertFile")]
    tls_ca_cert_file: Option<String>,
    #[serde(default)]
    tls_client_cert: Option<String>,
    #[serde(default)]
    tls_client_key: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsMode {
    #[default]
    Disable,
    Require,
    VerifyCa,
    VerifyFull,
}

impl FromStr for TlsMode {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "disable" | "disabled" => Ok(TlsMode::Disable),
            "require" => Ok(TlsMode::Require),
            "verify-ca" => Ok(TlsMode::VerifyCa),
            "verify-full" => Ok(TlsMode::VerifyFull),
            other => Err(format!("unsupported TLS mode '{other}'")),
        }
    }
}

/// Where CA certificates come from.
#[derive(Clone, PartialEq, Eq)]
pub enum PemSource {
    Inline(String),
    File(String),
}

impl fmt::Debug for PemSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PemSource::Inline(_) => f.write_str("Inline(..)"),
            PemSource::File(path) => write!(f, "File({path})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsSettings {
    pub mode: TlsMode,
    pub ca: Option<PemSource>,
    pub client_cert: Option<String>,
    pub client_key: Option<String>,
}

#[derive(Clone, PartialEq, Eq)]
pub enum Endpoint {
    Uri(String),
    Discrete {
        host: String,
        port: u16,
        database: Option<String>,
        user: Option<String>,
    },
}

/// Everything needed to open a session, secrets included.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub endpoint: Endpoint,
    pub password: Option<String>,
    pub tls: TlsSettings,
}

impl fmt::Debug for ConnectionSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = f.debug_struct("ConnectionSettings");
        match &self.endpoint {
            Endpoint::Uri(_) => out.field("endpoint", &"uri(..)"),
            Endpoint::Discrete {
                host,
                port,
                database,
                user,
            } => out
                .field("host", host)
                .field("port", port)
                .field("database", database)
                .field("user", user),
        };
        out.field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("tls", &self.tls)
            .finish()
    }
}

const DEFAULT_PORT: u16 = 5432;

impl ConnectionSettings {
    pub fn from_source(settings: &SourceSettings) -> Result<Self, String> {
        let data: JsonData = if settings.json_data.is_null() {
            JsonData::default()
        } else {
            serde_json::from_value(settings.json_data.clone())
                .map_err(|err| format!("invalid settings for source '{}': {err}", settings.uid))?
        };

        let secrets = &settings.decrypted_secure_json_data;
        let password = secrets
            .get("password")
            .filter(|value| !value.is_empty())
            .or_else(|| secrets.get("secretKey").filter(|value| !value.is_empty()))
            .cloned();

        let endpoint = match data.uri.filter(|uri| !uri.trim().is_empty()) {
            Some(uri) => Endpoint::Uri(uri),
            None => {
                let host = data
                    .host
                    .filter(|host| !host.trim().is_empty())
                    .ok_or_else(|| {
                        format!("source '{}' needs either a uri or a host", settings.uid)
                    })?;
                Endpoint::Discrete {
                    host,
                    port: data.port.unwrap_or(DEFAULT_PORT),
                    database: data.database.filter(|db| !db.is_empty()),
                    user: data.user.filter(|user| !user.is_empty()),
                }
            }
        };

        let mode = data.tls_mode.as_deref().unwrap_or("").parse::<TlsMode>()?;
        let ca = match (data.tls_ca_cert, data.tls_ca_cert_file) {
            (Some(pem), _) if !pem.trim().is_empty() => Some(PemSource::Inline(pem)),
            (_, Some(path)) if !path.trim().is_empty() => Some(PemSource::File(path)),
            _ => None,
        };

        if matches!(mode, TlsMode::VerifyCa | TlsMode::VerifyFull) && ca.is_none() {
            return Err(format!(
                "TLS mode {mode:?} for source '{}' requires CA certificate material",
                settings.uid
            ));
        }

        Ok(Self {
            endpoint,
            password,
            tls: TlsSettings {
                mode,
                ca,
                client_cert: data.tls_client_cert.filter(|v| !v.is_empty()),
                client_key: data.tls_client_key.filter(|v| !v.is_empty()),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn source(json_data: serde_json::Value, secrets: &[(&str, &str)]) -> SourceSettings {
        SourceSettings {
            uid: "ds-1".into(),
            updated: 1,
            json_data,
            decrypted_secure_json_data: secrets
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn port_accepts_string_or_number() {
        for port in [json!("6543"), json!(6543)] {
            let settings = ConnectionSettings::from_source(&source(
                json!({"host": "db.internal", "port": port, "user": "grafana"}),
                &[("password", "s3cret")],
            ))
            .unwrap();

            match settings.endpoint {
                Endpoint::Discrete { port, .. } => assert_eq!(port, 6543),
                Endpoint::Uri(_) => panic!("expected discrete endpoint"),
            }
            assert_eq!(settings.password.as_deref(), Some("s3cret"));
        }
    }

    #[test]
    fn uri_form_wins_over_discrete_fields() {
        let settings = ConnectionSettings::from_source(&source(
            json!({"uri": "postgres://u@h/db", "host": "ignored"}),
            &[],
        ))
        .unwrap();
        assert!(matches!(settings.endpoint, Endpoint::Uri(ref uri) if uri == "postgres://u@h/db"));
    }

    #[test]
    fn secret_key_is_used_when_password_missing() {
        let settings = ConnectionSettings::from_source(&source(
            json!({"host": "h"}),
            &[("secretKey", "cloud-token")],
        ))
        .unwrap();
        assert_eq!(settings.password.as_deref(), Some("cloud-token"));
    }

    #[test]
    fn verify_mode_without_ca_is_rejected() {
        let err = ConnectionSettings::from_source(&source(
            json!({"host": "h", "tlsMode": "verify-full"}),
            &[],
        ))
        .unwrap_err();
        assert!(err.contains("CA certificate"), "{err}");
    }

    #[test]
    fn require_mode_does_not_need_ca() {
        let settings = ConnectionSettings::from_source(&source(
            json!({"host": "h", "tlsMode": "require"}),
            &[],
        ))
        .unwrap();
        assert_eq!(settings.tls.mode, TlsMode::Require);
        assert!(settings.tls.ca.is_none());
    }

    #[test]
    fn verify_ca_without_ca_is_rejected() {
        let err = ConnectionSettings::from_source(&source(
            json!({"host": "h", "tlsMode": "verify-ca"}),
            &[],
        ))
        .unwrap_err();
        assert!(err.contains("CA certificate"), "{err}");
    }

    #[test]
    fn missing_host_and_uri_is_rejected() {
        let err = ConnectionSettings::from_source(&source(json!({}), &[])).unwrap_err();
        assert!(err.contains("uri or a host"), "{err}");
    }

    #[test]
    fn debug_output_redacts_password() {
        let settings = ConnectionSettings::from_source(&source(
            json!({"host": "h"}),
            &[("password", "hunter2")],
        ))
        .unwrap();
        assert!(!format!("{settings:?}").contains("hunter2"));
    }
}
