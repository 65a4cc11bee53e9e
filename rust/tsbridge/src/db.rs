//! Postgres-backed sessions: a bb8 pool of tokio-postgres clients per
//! generation, with optional rustls transport.

use crate::{
    datasource::{ConnectionSettings, Endpoint, PemSource, TlsMode, TlsSettings},
    engine::{Connector, EngineError, Session},
    models::RowSet,
    query::BoundArguments,
    value::{self, Value},
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use bb8::{ErrorSink, ManageConnection, Pool, RunError};
use parking_lot::Mutex;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::{self, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use rustls_pemfile::certs;
use std::{collections::HashMap, io::BufReader, sync::Arc, time::Duration};
use tokio_postgres::{config::SslMode, types::ToSql, Client, Config as PgConfig, NoTls};
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{debug, error, info};

pub type PgPool = Pool<PgConnectionManager>;

/// Opens one pool per generation after a direct connectivity check.
pub struct PgConnector {
    pool_size: u32,
    connect_timeout: Duration,
}

impl PgConnector {
    pub fn new(pool_size: u32, connect_timeout: Duration) -> Self {
        Self {
            pool_size: pool_size.max(1),
            connect_timeout,
        }
    }
}

#[async_trait]
impl Connector for PgConnector {
    async fn connect(&self, settings: &ConnectionSettings) -> Result<Arc<dyn Session>, EngineError> {
        let manager = PgConnectionManager::new(settings).map_err(engine_error)?;

        // Connect outside the pool so the driver's own error reaches the caller.
        match tokio::time::timeout(self.connect_timeout, manager.connect()).await {
            Ok(Ok(_)) => info!("database connectivity check succeeded"),
            Ok(Err(err)) => {
                error!(error = %format!("{err:#}"), "initial database connectivity check failed");
                return Err(engine_error(err));
            }
            Err(_) => {
                let message = format!(
                    "timed out after {:?} connecting to the database",
                    self.connect_timeout
                );
                error!(error = %message, "initial database connectivity check failed");
                return Err(EngineError::new(message));
            }
        }

        let last_error = LastError::default();
        let pool = Pool::builder()
            .max_size(self.pool_size)
            .connection_timeout(self.connect_timeout)
            .error_sink(Box::new(last_error.clone()))
            .build_unchecked(manager);

        Ok(Arc::new(PgSession {
            pool: Mutex::new(Some(pool)),
            last_error,
        }))
    }
}

/// Keeps the most recent connection failure seen by the pool, which bb8
/// otherwise reports only as a checkout timeout.
#[derive(Debug, Clone, Default)]
struct LastError(Arc<Mutex<Option<String>>>);

impl LastError {
    fn take(&self) -> Option<String> {
        self.0.lock().take()
    }
}

impl ErrorSink<anyhow::Error> for LastError {
    fn sink(&self, err: anyhow::Error) {
        let message = format!("{err:#}");
        error!(error = %message, "failed to open pooled connection");
        *self.0.lock() = Some(message);
    }

    fn boxed_clone(&self) -> Box<dyn ErrorSink<anyhow::Error>> {
        Box::new(self.clone())
    }
}

#[derive(Clone)]
pub struct PgConnectionManager {
    config: PgConfig,
    tls: PgTls,
}

#[derive(Clone)]
enum PgTls {
    None,
    Rustls(MakeRustlsConnect),
}

impl PgConnectionManager {
    fn new(settings: &ConnectionSettings) -> Result<Self> {
        let config = pg_config(settings)?;
        let tls = match settings.tls.mode {
            TlsMode::Disable => PgTls::None,
            _ => PgTls::Rustls(build_tls_connector(&settings.tls)?),
        };
        Ok(Self { config, tls })
    }
}

#[async_trait]
impl ManageConnection for PgConnectionManager {
    type Connection = Client;
    type Error = anyhow::Error;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        let client = match &self.tls {
            PgTls::None => {
                let (client, connection) = self.config.connect(NoTls).await.map_err(pg_error)?;
                tokio::spawn(async move {
                    if let Err(err) = connection.await {
                        error!(error = %err, "postgres connection terminated");
                    }
                });
                client
            }
            PgTls::Rustls(connector) => {
                let (client, connection) = self
                    .config
                    .connect(connector.clone())
                    .await
                    .map_err(pg_error)?;
                tokio::spawn(async move {
                    if let Err(err) = connection.await {
                        error!(error = %err, "postgres connection terminated");
                    }
                });
                client
            }
        };
        Ok(client)
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        conn.simple_query("SELECT 1").await.map_err(pg_error)?;
        Ok(())
    }

    fn has_broken(&self, conn: &mut Self::Connection) -> bool {
        conn.is_closed()
    }
}

fn pg_config(settings: &ConnectionSettings) -> Result<PgConfig> {
    let mut config = match &settings.endpoint {
        Endpoint::Uri(uri) => uri
            .parse::<PgConfig>()
            .context("invalid connection uri")?,
        Endpoint::Discrete {
            host,
            port,
            database,
            user,
        } => {
            let mut config = PgConfig::new();
            config.host(host).port(*port);
            if let Some(database) = database {
                config.dbname(database);
            }
            if let Some(user) = user {
                config.user(user);
            }
            config
        }
    };

    if let Some(password) = &settings.password {
        config.password(password);
    }

    // The source's TLS mode overrides any sslmode in the uri; the driver's
    // default would fall back to plaintext when the server declines TLS.
    config.ssl_mode(match settings.tls.mode {
        TlsMode::Disable => SslMode::Disable,
        TlsMode::Require | TlsMode::VerifyCa | TlsMode::VerifyFull => SslMode::Require,
    });
    config.application_name("tsbridge");
    Ok(config)
}

/// `require` encrypts without checking the certificate unless CA material is
/// given, `verify-ca` checks the chain only, `verify-full` also checks the
/// host name.
fn build_tls_connector(tls: &TlsSettings) -> Result<MakeRustlsConnect> {
    let provider = Arc::new(crypto::ring::default_provider());

    let verifier: Arc<dyn ServerCertVerifier> = match (tls.mode, tls.ca.as_ref()) {
        (TlsMode::Disable, _) => anyhow::bail!("TLS connector requested with TLS disabled"),
        (TlsMode::Require, None) => Arc::new(EncryptOnlyVerifier {
            provider: Arc::clone(&provider),
        }),
        (TlsMode::Require | TlsMode::VerifyCa, Some(ca)) => Arc::new(ChainOnlyVerifier {
            inner: webpki_verifier(ca, &provider)?,
        }),
        (TlsMode::VerifyFull, Some(ca)) => webpki_verifier(ca, &provider)?,
        (TlsMode::VerifyCa | TlsMode::VerifyFull, None) => {
            anyhow::bail!("TLS mode {:?} requires a CA certificate", tls.mode)
        }
    };

    let builder = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .context("failed to select TLS protocol versions")?
        .dangerous()
        .with_custom_certificate_verifier(verifier);

    let config = match (tls.client_cert.as_deref(), tls.client_key.as_deref()) {
        (None, None) => builder.with_no_client_auth(),
        (Some(cert), Some(key)) => {
            let certs = load_client_certs(cert)?;
            let key = load_client_key(key)?;
            builder
                .with_client_auth_cert(certs, key)
                .context("failed to build client TLS config")?
        }
        _ => anyhow::bail!("tlsClientCert and tlsClientKey must both be set (or neither)"),
    };

    Ok(MakeRustlsConnect::new(config))
}

fn webpki_verifier(
    ca: &PemSource,
    provider: &Arc<CryptoProvider>,
) -> Result<Arc<WebPkiServerVerifier>> {
    let pem = match ca {
        PemSource::Inline(pem) => pem.clone().into_bytes(),
        PemSource::File(path) => std::fs::read(path)
            .with_context(|| format!("failed to open CA certificate file '{path}'"))?,
    };

    let mut root_store = RootCertStore::empty();
    for cert in certs(&mut BufReader::new(pem.as_slice())) {
        let cert = cert.context("failed to parse CA certificate")?;
        root_store
            .add(cert)
            .map_err(|_| anyhow::anyhow!("invalid CA certificate"))?;
    }
    if root_store.is_empty() {
        anyhow::bail!("CA certificate material contained no certificates");
    }

    WebPkiServerVerifier::builder_with_provider(Arc::new(root_store), Arc::clone(provider))
        .build()
        .context("failed to build certificate verifier")
}

/// Checks the chain against the CA but accepts any host name.
#[derive(Debug)]
struct ChainOnlyVerifier {
    inner: Arc<WebPkiServerVerifier>,
}

impl ServerCertVerifier for ChainOnlyVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        match self
            .inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            Err(rustls::Error::InvalidCertificate(ref err)) if is_name_mismatch(err) => {
                Ok(ServerCertVerified::assertion())
            }
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

// Name checks run after the chain is validated, so a name mismatch means the
// chain itself was trusted. Later rustls releases add context to the variant.
fn is_name_mismatch(err: &CertificateError) -> bool {
    format!("{err:?}").starts_with("NotValidForName")
}

/// Accepts any certificate but still checks handshake signatures.
#[derive(Debug)]
struct EncryptOnlyVerifier {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for EncryptOnlyVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

// Client material is either inline PEM or a path to a PEM file.
fn read_pem(source: &str, what: &str) -> Result<Vec<u8>> {
    if source.trim_start().starts_with("-----BEGIN") {
        return Ok(source.as_bytes().to_vec());
    }
    std::fs::read(source).with_context(|| format!("failed to open {what} file '{source}'"))
}

fn load_client_certs(source: &str) -> Result<Vec<CertificateDer<'static>>> {
    let pem = read_pem(source, "client certificate")?;
    let mut chain = Vec::new();
    for cert in certs(&mut BufReader::new(pem.as_slice())) {
        chain.push(cert.context("failed to parse client certificate")?);
    }

    if chain.is_empty() {
        anyhow::bail!("client certificate contained no certificates");
    }

    Ok(chain)
}

fn load_client_key(source: &str) -> Result<PrivateKeyDer<'static>> {
    let pem = read_pem(source, "client key")?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(pem.as_slice()))
        .context("failed to parse client key")?
        .context("client key contained no private keys")?;

    Ok(key)
}

/// Session over a pool that is dropped on close.
pub struct PgSession {
    pool: Mutex<Option<PgPool>>,
    last_error: LastError,
}

impl PgSession {
    fn pool(&self) -> Result<PgPool, EngineError> {
        self.pool
            .lock()
            .clone()
            .ok_or_else(|| EngineError::new("session is closed"))
    }

    fn checkout_error(&self, err: RunError<anyhow::Error>) -> EngineError {
        match err {
            RunError::User(err) => engine_error(err),
            RunError::TimedOut => EngineError::new(self.last_error.take().unwrap_or_else(|| {
                "timed out waiting for a database connection".to_string()
            })),
        }
    }
}

#[async_trait]
impl Session for PgSession {
    async fn query(&self, text: &str, args: &BoundArguments) -> Result<RowSet, EngineError> {
        let (sql, params) = number_placeholders(text, args);
        debug!(sql = %sql, params = params.len(), "executing query");

        let pool = self.pool()?;
        let client = pool.get().await.map_err(|err| self.checkout_error(err))?;

        let statement = client.prepare(&sql).await.map_err(pg_engine_error)?;
        let params: Vec<&(dyn ToSql + Sync)> =
            params.iter().map(|value| *value as &(dyn ToSql + Sync)).collect();
        let rows = client
            .query(&statement, &params)
            .await
            .map_err(pg_engine_error)?;

        let columns: Vec<String> = statement
            .columns()
            .iter()
            .map(|column| column.name().to_string())
            .collect();

        let mut decoded = Vec::with_capacity(rows.len());
        for row in &rows {
            let values = (0..columns.len())
                .map(|idx| value::from_row(row, idx))
                .collect::<Result<Vec<_>, _>>()
                .map_err(EngineError::new)?;
            decoded.push(values);
        }

        Ok(RowSet::new(columns, decoded))
    }

    async fn close(&self) -> Result<(), EngineError> {
        match self.pool.lock().take() {
            Some(pool) => {
                let state = pool.state();
                debug!(connections = state.connections, "closing session pool");
                Ok(())
            }
            None => Err(EngineError::new("session already closed")),
        }
    }
}

/// Rewrites `$name` placeholders to positional `$n` and returns the bound
/// values in position order. Quoted text, comments, dollar-quoted bodies and
/// names with no bound argument are left untouched.
pub fn number_placeholders<'a>(sql: &str, args: &'a BoundArguments) -> (String, Vec<&'a Value>) {
    let chars: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len());
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut params: Vec<&Value> = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\'' | '"' => {
                let end = skip_quoted(&chars, i, c);
                out.extend(&chars[i..end]);
                i = end;
            }
            '-' if chars.get(i + 1) == Some(&'-') => {
                let end = chars[i..]
                    .iter()
                    .position(|&ch| ch == '\n')
                    .map_or(chars.len(), |offset| i + offset);
                out.extend(&chars[i..end]);
                i = end;
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                let end = find(&chars, i + 2, &['*', '/']).map_or(chars.len(), |at| at + 2);
                out.extend(&chars[i..end]);
                i = end;
            }
            '$' => {
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && (chars[end].is_alphanumeric() || chars[end] == '_') {
                    end += 1;
                }
                let tag: String = chars[start..end].iter().collect();

                if chars.get(end) == Some(&'$') && !tag.starts_with(|ch: char| ch.is_ascii_digit()) {
                    // $tag$ ... $tag$
                    let delimiter: Vec<char> = chars[i..=end].to_vec();
                    let close = find(&chars, end + 1, &delimiter)
                        .map_or(chars.len(), |at| at + delimiter.len());
                    out.extend(&chars[i..close]);
                    i = close;
                } else if let Some(value) = args.get(&tag).filter(|_| is_name(&tag)) {
                    let position = match positions.get(&tag) {
                        Some(position) => *position,
                        None => {
                            params.push(value);
                            positions.insert(tag.clone(), params.len());
                            params.len()
                        }
                    };
                    out.push('$');
                    out.push_str(&position.to_string());
                    i = end;
                } else {
                    out.extend(&chars[i..end]);
                    i = end;
                }
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }

    (out, params)
}

fn is_name(tag: &str) -> bool {
    tag.starts_with(|ch: char| ch.is_alphabetic() || ch == '_')
}

// Returns the index just past the closing quote; doubled quotes are escapes.
fn skip_quoted(chars: &[char], start: usize, quote: char) -> usize {
    let mut i = start + 1;
    while i < chars.len() {
        if chars[i] == quote {
            if chars.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    chars.len()
}

fn find(chars: &[char], from: usize, needle: &[char]) -> Option<usize> {
    if from > chars.len() {
        return None;
    }
    chars[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|offset| from + offset)
}

fn pg_error(err: tokio_postgres::Error) -> anyhow::Error {
    anyhow::anyhow!(pg_message(&err))
}

fn pg_engine_error(err: tokio_postgres::Error) -> EngineError {
    EngineError::new(pg_message(&err))
}

// Server-side errors carry the engine's own message; everything else falls
// back to the driver's description.
fn pg_message(err: &tokio_postgres::Error) -> String {
    match err.as_db_error() {
        Some(db) => db.message().to_string(),
        None => err.to_string(),
    }
}

fn engine_error(err: anyhow::Error) -> EngineError {
    EngineError::new(format!("{err:#}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasource::SourceSettings;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn args(pairs: &[(&str, Value)]) -> BoundArguments {
        let mut bound = BoundArguments::new();
        for (name, value) in pairs {
            bound.insert(*name, value.clone());
        }
        bound
    }

    #[test]
    fn numbers_placeholders_in_first_use_order() {
        let bound = args(&[("host", Value::from("a")), ("limit", Value::Int(5))]);
        let (sql, params) =
            number_placeholders("SELECT * FROM t WHERE h = $host LIMIT $limit OFFSET $host", &bound);

        assert_eq!(sql, "SELECT * FROM t WHERE h = $1 LIMIT $2 OFFSET $1");
        assert_eq!(params, vec![&Value::from("a"), &Value::Int(5)]);
    }

    #[test]
    fn leaves_quotes_comments_and_dollar_bodies_alone() {
        let bound = args(&[("x", Value::Int(1))]);
        let sql = "SELECT '$x', \"$x\" -- $x\n, /* $x */ $body$ $x $body$, $$ $x $$, $x::int";
        let (rewritten, params) = number_placeholders(sql, &bound);

        assert_eq!(
            rewritten,
            "SELECT '$x', \"$x\" -- $x\n, /* $x */ $body$ $x $body$, $$ $x $$, $1::int"
        );
        assert_eq!(params.len(), 1);
    }

    #[test]
    fn positional_placeholders_pass_through() {
        let bound = BoundArguments::new();
        let (sql, params) = number_placeholders("SELECT $1", &bound);
        assert_eq!(sql, "SELECT $1");
        assert!(params.is_empty());
    }

    #[test]
    fn unbound_names_are_left_for_the_engine() {
        let bound = args(&[("known", Value::Int(1))]);
        let (sql, params) = number_placeholders("SELECT $missing, $known", &bound);
        assert_eq!(sql, "SELECT $missing, $1");
        assert_eq!(params, vec![&Value::Int(1)]);
    }

    #[test]
    fn discrete_settings_build_config() {
        let settings = ConnectionSettings::from_source(&SourceSettings {
            uid: "pg".into(),
            updated: 1,
            json_data: json!({"host": "db.internal", "port": 6543, "database": "metrics", "user": "reader"}),
            decrypted_secure_json_data: [("password".to_string(), "pw".to_string())].into(),
        })
        .unwrap();

        let config = pg_config(&settings).unwrap();
        assert_eq!(config.get_ports(), &[6543]);
        assert_eq!(config.get_dbname(), Some("metrics"));
        assert_eq!(config.get_user(), Some("reader"));
        assert_eq!(config.get_password(), Some("pw".as_bytes()));
    }

    fn tls_source(json_data: serde_json::Value) -> ConnectionSettings {
        ConnectionSettings::from_source(&SourceSettings {
            uid: "pg".into(),
            updated: 1,
            json_data,
            ..Default::default()
        })
        .unwrap()
    }

    fn tls(mode: TlsMode, ca: Option<&str>) -> TlsSettings {
        TlsSettings {
            mode,
            ca: ca.map(|pem| PemSource::Inline(pem.to_string())),
            client_cert: None,
            client_key: None,
        }
    }

    #[test]
    fn tls_modes_never_fall_back_to_plaintext() {
        for mode in ["require", "verify-ca", "verify-full"] {
            let settings = tls_source(json!({
                "host": "db.internal",
                "tlsMode": mode,
                "tlsCACert": "-----BEGIN CERTIFICATE-----",
            }));
            let config = pg_config(&settings).unwrap();
            assert_eq!(config.get_ssl_mode(), SslMode::Require, "{mode}");
        }

        let plain = tls_source(json!({"host": "db.internal"}));
        assert_eq!(pg_config(&plain).unwrap().get_ssl_mode(), SslMode::Disable);
    }

    #[test]
    fn tls_mode_overrides_uri_sslmode() {
        let settings = tls_source(json!({
            "uri": "postgres://u@h/db?sslmode=prefer",
            "tlsMode": "verify-full",
            "tlsCACertFile": "/etc/ssl/ca.pem",
        }));
        assert_eq!(pg_config(&settings).unwrap().get_ssl_mode(), SslMode::Require);
    }

    #[test]
    fn require_without_ca_encrypts_without_verification() {
        assert!(build_tls_connector(&tls(TlsMode::Require, None)).is_ok());
    }

    #[test]
    fn verifying_modes_need_usable_ca_material() {
        for mode in [TlsMode::VerifyCa, TlsMode::VerifyFull] {
            assert!(build_tls_connector(&tls(mode, None)).is_err(), "{mode:?}");
        }
        for mode in [TlsMode::Require, TlsMode::VerifyCa, TlsMode::VerifyFull] {
            let err = build_tls_connector(&tls(mode, Some("not a pem")))
                .err()
                .expect("garbage CA must be rejected");
            assert!(format!("{err:#}").contains("no certificates"), "{mode:?}: {err:#}");
        }
    }

    #[test]
    fn unpaired_client_certificate_is_rejected() {
        let mut settings = tls(TlsMode::Require, None);
        settings.client_cert = Some("-----BEGIN CERTIFICATE-----".into());
        let err = build_tls_connector(&settings).err().expect("pair is required");
        assert!(format!("{err:#}").contains("must both be set"));
    }

    #[tokio::test]
    async fn unreachable_host_reports_driver_error() {
        let settings = tls_source(json!({"host": "127.0.0.1", "port": 1}));
        let err = PgConnector::new(1, Duration::from_secs(5))
            .connect(&settings)
            .await
            .err()
            .expect("nothing listens on port 1");

        let message = err.message.to_lowercase();
        assert!(message.contains("connection refused"), "{}", err.message);
        assert!(!message.contains("timed out"), "{}", err.message);
    }
}
