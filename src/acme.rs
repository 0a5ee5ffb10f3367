//! On-demand certificate issuance.
//!
//! The first TLS handshake for a hostname triggers an ACME order; the
//! resulting certificate is cached as a PEM pair in the certificate
//! directory and survives restarts. Only the configured domain and its
//! subdomains may obtain certificates; everything else fails fast with an
//! unauthorized-host error that aborts that handshake only.
//!
//! HTTP-01 challenges are answered by the port-80 listener (see
//! [`crate::redirect`]) out of the live token table kept here.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, LetsEncrypt,
    NewAccount, NewOrder, OrderStatus,
};
use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio::sync::{Mutex, OnceCell};
use tracing::{info, warn};

use crate::error::CertError;

/// Directory where certificates and the ACME account key are cached.
pub const DEFAULT_CACHE_DIR: &str = "certs";

/// Issues and caches certificates for one root domain.
pub struct AcmeIssuer {
    domain: String,
    contact_email: String,
    cache_dir: PathBuf,
    directory_url: String,

    /// Live HTTP-01 challenges: token → key authorization.
    http_tokens: DashMap<String, String>,

    /// Per-host TLS configs built from issued or cached certificates.
    configs: DashMap<String, Arc<ServerConfig>>,

    account: OnceCell<Account>,

    /// Serializes issuance; concurrent handshakes for the same new host
    /// collapse into one order.
    issue_lock: Mutex<()>,
}

impl AcmeIssuer {
    pub fn new(domain: &str, contact_email: &str, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            domain: domain.to_ascii_lowercase(),
            contact_email: contact_email.to_string(),
            cache_dir: cache_dir.into(),
            directory_url: LetsEncrypt::Production.url().to_string(),
            http_tokens: DashMap::new(),
            configs: DashMap::new(),
            account: OnceCell::new(),
            issue_lock: Mutex::new(()),
        }
    }

    /// Certificate issuance is attempted iff the host is the apex domain or
    /// one of its subdomains.
    pub fn host_allowed(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        host == self.domain || host.ends_with(&format!(".{}", self.domain))
    }

    /// Key authorization for a live HTTP-01 challenge token.
    pub fn http01_key_authorization(&self, token: &str) -> Option<String> {
        self.http_tokens.get(token).map(|entry| entry.clone())
    }

    /// TLS config for one handshake. Awaits issuance on a cache miss.
    pub async fn server_config_for(&self, host: &str) -> Result<Arc<ServerConfig>, CertError> {
        let host = host.to_ascii_lowercase();
        if !self.host_allowed(&host) {
            return Err(CertError::UnauthorizedHost(host));
        }

        if let Some(config) = self.configs.get(&host) {
            return Ok(Arc::clone(&config));
        }

        let _issuing = self.issue_lock.lock().await;
        // A racing handshake may have finished the same order.
        if let Some(config) = self.configs.get(&host) {
            return Ok(Arc::clone(&config));
        }

        let (chain, key) = match self.load_cached(&host) {
            Some(pair) => pair,
            None => self.issue(&host).await?,
        };
        // TODO: re-issue when a cached certificate nears expiry; needs a
        // renewal timer keyed off the leaf's notAfter.

        let config = build_server_config(&host, chain, key)?;
        self.configs.insert(host.clone(), Arc::clone(&config));
        Ok(config)
    }

    fn cert_path(&self, host: &str) -> PathBuf {
        self.cache_dir.join(format!("{host}.crt"))
    }

    fn key_path(&self, host: &str) -> PathBuf {
        self.cache_dir.join(format!("{host}.key"))
    }

    /// Load a PEM pair from the cache directory, if both halves parse.
    fn load_cached(
        &self,
        host: &str,
    ) -> Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
        let cert_pem = std::fs::read(self.cert_path(host)).ok()?;
        let key_pem = std::fs::read(self.key_path(host)).ok()?;
        parse_pem_pair(&cert_pem, &key_pem).ok()
    }

    async fn account(&self) -> Result<&Account, CertError> {
        self.account
            .get_or_try_init(|| async {
                let creds_path = self.cache_dir.join("account.json");
                if let Ok(raw) = std::fs::read(&creds_path) {
                    match serde_json::from_slice::<AccountCredentials>(&raw) {
                        Ok(credentials) => match Account::from_credentials(credentials).await {
                            Ok(account) => return Ok(account),
                            Err(e) => warn!(error = %e, "stored ACME account rejected, creating a new one"),
                        },
                        Err(e) => warn!(error = %e, "stored ACME credentials unreadable"),
                    }
                }

                let contact = format!("mailto:{}", self.contact_email);
                let (account, credentials) = Account::create(
                    &NewAccount {
                        contact: &[&contact],
                        terms_of_service_agreed: true,
                        only_return_existing: false,
                    },
                    &self.directory_url,
                    None,
                )
                .await
                .map_err(|e| CertError::Acme(format!("account creation failed: {e}")))?;

                std::fs::create_dir_all(&self.cache_dir)?;
                let serialized = serde_json::to_vec(&credentials)
                    .map_err(|e| CertError::Acme(format!("credentials serialize failed: {e}")))?;
                std::fs::write(&creds_path, serialized)?;
                info!(contact = %self.contact_email, "ACME account created");
                Ok(account)
            })
            .await
    }

    /// Run one HTTP-01 order for `host` and persist the result.
    async fn issue(
        &self,
        host: &str,
    ) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), CertError> {
        info!(host = %host, "requesting certificate");
        let account = self.account().await?;

        let identifier = Identifier::Dns(host.to_string());
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &[identifier],
            })
            .await
            .map_err(|e| CertError::Acme(format!("new order failed: {e}")))?;

        let authorizations = order
            .authorizations()
            .await
            .map_err(|e| CertError::Acme(format!("authorizations fetch failed: {e}")))?;

        let mut published_tokens = Vec::new();
        for authz in &authorizations {
            match authz.status {
                AuthorizationStatus::Valid => continue,
                AuthorizationStatus::Pending => {}
                other => {
                    self.forget_tokens(&published_tokens);
                    return Err(CertError::Acme(format!(
                        "authorization for {host} in state {other:?}"
                    )));
                }
            }

            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Http01)
                .ok_or_else(|| CertError::Acme("no HTTP-01 challenge offered".to_string()))?;

            let key_auth = order.key_authorization(challenge);
            self.http_tokens
                .insert(challenge.token.clone(), key_auth.as_str().to_string());
            published_tokens.push(challenge.token.clone());

            order
                .set_challenge_ready(&challenge.url)
                .await
                .map_err(|e| CertError::Acme(format!("challenge ready failed: {e}")))?;
        }

        // Poll the order with backoff until the CA validates the challenge.
        let mut delay = Duration::from_millis(500);
        let mut status = OrderStatus::Pending;
        for _ in 0..10 {
            tokio::time::sleep(delay).await;
            let state = order
                .refresh()
                .await
                .map_err(|e| CertError::Acme(format!("order refresh failed: {e}")))?;
            status = state.status;
            match status {
                OrderStatus::Ready | OrderStatus::Valid => break,
                OrderStatus::Invalid => {
                    self.forget_tokens(&published_tokens);
                    return Err(CertError::Acme(format!("order for {host} became invalid")));
                }
                _ => {}
            }
            delay = (delay * 2).min(Duration::from_secs(8));
        }
        if !matches!(status, OrderStatus::Ready | OrderStatus::Valid) {
            self.forget_tokens(&published_tokens);
            return Err(CertError::Acme(format!(
                "order for {host} did not become ready"
            )));
        }

        let mut params = rcgen::CertificateParams::new(vec![host.to_string()])
            .map_err(|e| CertError::Acme(format!("csr params: {e}")))?;
        params.distinguished_name = rcgen::DistinguishedName::new();
        let key_pair =
            rcgen::KeyPair::generate().map_err(|e| CertError::Acme(format!("keygen: {e}")))?;
        let csr = params
            .serialize_request(&key_pair)
            .map_err(|e| CertError::Acme(format!("csr: {e}")))?;

        if status == OrderStatus::Ready {
            order
                .finalize(csr.der())
                .await
                .map_err(|e| CertError::Acme(format!("finalize failed: {e}")))?;
        }

        let mut cert_chain_pem = None;
        for _ in 0..10 {
            match order
                .certificate()
                .await
                .map_err(|e| CertError::Acme(format!("certificate fetch failed: {e}")))?
            {
                Some(pem) => {
                    cert_chain_pem = Some(pem);
                    break;
                }
                None => tokio::time::sleep(Duration::from_secs(1)).await,
            }
        }
        self.forget_tokens(&published_tokens);
        let cert_chain_pem = cert_chain_pem
            .ok_or_else(|| CertError::Acme(format!("certificate for {host} never issued")))?;

        std::fs::create_dir_all(&self.cache_dir)?;
        std::fs::write(self.cert_path(host), cert_chain_pem.as_bytes())?;
        std::fs::write(self.key_path(host), key_pair.serialize_pem().as_bytes())?;
        info!(host = %host, "certificate issued and cached");

        parse_pem_pair(cert_chain_pem.as_bytes(), key_pair.serialize_pem().as_bytes()).map_err(
            |e| CertError::KeyMaterial {
                host: host.to_string(),
                reason: e.to_string(),
            },
        )
    }

    fn forget_tokens(&self, tokens: &[String]) {
        for token in tokens {
            self.http_tokens.remove(token);
        }
    }

    #[cfg(test)]
    pub(crate) fn test_publish_token(&self, token: &str, key_auth: &str) {
        self.http_tokens.insert(token.into(), key_auth.into());
    }
}

/// Parse a PEM certificate chain and private key into rustls types.
pub fn parse_pem_pair(
    cert_pem: &[u8],
    key_pem: &[u8],
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), std::io::Error> {
    let chain = rustls_pemfile::certs(&mut &cert_pem[..]).collect::<Result<Vec<_>, _>>()?;
    if chain.is_empty() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "no certificates in PEM",
        ));
    }
    let key = rustls_pemfile::private_key(&mut &key_pem[..])?.ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, "no private key in PEM")
    })?;
    Ok((chain, key))
}

/// A TLS config serving exactly one host's chain.
pub fn build_server_config(
    host: &str,
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<Arc<ServerConfig>, CertError> {
    // rustls needs a process-wide crypto provider; first caller installs it.
    static CRYPTO_INIT: std::sync::OnceLock<()> = std::sync::OnceLock::new();
    CRYPTO_INIT.get_or_init(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .map_err(|e| CertError::KeyMaterial {
            host: host.to_string(),
            reason: e.to_string(),
        })?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issuer_for(dir: &std::path::Path) -> AcmeIssuer {
        AcmeIssuer::new("example.test", "ops@example.test", dir)
    }

    #[test]
    fn host_policy_allows_apex_and_subdomains() {
        let dir = tempfile::tempdir().unwrap();
        let issuer = issuer_for(dir.path());

        assert!(issuer.host_allowed("example.test"));
        assert!(issuer.host_allowed("ankara.example.test"));
        assert!(issuer.host_allowed("ANKARA.EXAMPLE.TEST"));
        assert!(issuer.host_allowed("a.b.example.test"));
    }

    #[test]
    fn host_policy_rejects_everything_else() {
        let dir = tempfile::tempdir().unwrap();
        let issuer = issuer_for(dir.path());

        assert!(!issuer.host_allowed("example.com"));
        assert!(!issuer.host_allowed("evilexample.test"));
        assert!(!issuer.host_allowed("example.test.evil.com"));
        assert!(!issuer.host_allowed(""));
    }

    #[tokio::test]
    async fn unauthorized_host_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let issuer = issuer_for(dir.path());
        assert!(matches!(
            issuer.server_config_for("foreign.com").await,
            Err(CertError::UnauthorizedHost(_))
        ));
    }

    #[tokio::test]
    async fn cached_pem_pair_builds_a_config() {
        let dir = tempfile::tempdir().unwrap();
        let issuer = issuer_for(dir.path());

        let self_signed =
            rcgen::generate_simple_self_signed(vec!["ankara.example.test".to_string()]).unwrap();
        std::fs::write(
            issuer.cert_path("ankara.example.test"),
            self_signed.cert.pem(),
        )
        .unwrap();
        std::fs::write(
            issuer.key_path("ankara.example.test"),
            self_signed.key_pair.serialize_pem(),
        )
        .unwrap();

        let config = issuer
            .server_config_for("ankara.example.test")
            .await
            .expect("cached cert should satisfy the handshake");
        assert!(config.alpn_protocols.contains(&b"h2".to_vec()));
    }

    #[test]
    fn challenge_tokens_live_and_die_with_orders() {
        let dir = tempfile::tempdir().unwrap();
        let issuer = issuer_for(dir.path());

        issuer
            .http_tokens
            .insert("tok".to_string(), "tok.keyauth".to_string());
        assert_eq!(
            issuer.http01_key_authorization("tok"),
            Some("tok.keyauth".to_string())
        );
        issuer.forget_tokens(&["tok".to_string()]);
        assert_eq!(issuer.http01_key_authorization("tok"), None);
    }

    #[test]
    fn pem_pair_parse_rejects_garbage() {
        assert!(parse_pem_pair(b"not pem", b"not pem").is_err());
    }
}
