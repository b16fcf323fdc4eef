//! Automatic certificates over ACME (TLS-ALPN-01).
//!
//! One [`AcmeResolver`] exists per cache directory and is shared by every
//! listener pointing at that directory. Certificates are resolved per
//! handshake from, in order: pending challenge certificates (only for
//! `acme-tls/1` handshakes), memory, `<dir>/<domain>.crt` + `.key`. When none
//! is available a background order is started and the handshake fails; the
//! next handshake after the order completes succeeds.
//! After a failed order the domain is not ordered again for ten minutes.
//!
//! Account credentials live in `<dir>/acme_account.json`.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use {
    dashmap::DashMap,
    instant_acme::{
        Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
        NewOrder, Order, OrderStatus,
    },
    rcgen::{CertificateParams, CustomExtension, DistinguishedName, KeyPair},
    rustls::{
        pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer},
        server::{ClientHello, ResolvesServerCert},
        sign::CertifiedKey,
    },
    tokio::sync::OnceCell,
    tracing::{debug, info, warn},
};

use {
    crate::{error::AcmeError, tls},
    webirc_config::AcmeConfig,
};

/// ALPN protocol id of TLS-ALPN-01 validation handshakes.
pub const ACME_TLS_ALPN: &[u8] = b"acme-tls/1";

/// Certificates are renewed this long before they expire.
const RENEW_BEFORE: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// A domain whose order failed gets no new order for this long.
const RETRY_BACKOFF: Duration = Duration::from_secs(10 * 60);

const ACCOUNT_FILE: &str = "acme_account.json";

/// Polling schedule while waiting on the ACME server.
const POLL_ATTEMPTS: u32 = 10;
const POLL_INITIAL_DELAY: Duration = Duration::from_millis(250);
const POLL_MAX_DELAY: Duration = Duration::from_secs(8);

/// Hands out one shared resolver per cache directory.
pub struct AcmeManager {
    settings: AcmeConfig,
    providers: DashMap<PathBuf, Arc<AcmeResolver>>,
}

impl AcmeManager {
    pub fn new(settings: &AcmeConfig) -> Self {
        Self {
            settings: settings.clone(),
            providers: DashMap::new(),
        }
    }

    /// The resolver for `dir`, created on first use.
    pub fn get(&self, dir: &Path) -> Arc<AcmeResolver> {
        let entry = self.providers.entry(dir.to_path_buf()).or_insert_with(|| {
            debug!(dir = %dir.display(), "creating ACME certificate provider");
            Arc::new(AcmeResolver::new(dir.to_path_buf(), self.settings.clone()))
        });
        Arc::clone(entry.value())
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

struct CachedCert {
    key: Arc<CertifiedKey>,
    /// Unix seconds.
    not_after: i64,
}

struct AcmeState {
    dir: PathBuf,
    settings: AcmeConfig,
    account: OnceCell<Account>,
    certs: DashMap<String, CachedCert>,
    challenges: DashMap<String, Arc<CertifiedKey>>,
    pending: Mutex<HashSet<String>>,
    /// Domains whose last order failed, with when they may be ordered again.
    retry_after: DashMap<String, Instant>,
}

/// rustls certificate resolver backed by an ACME account and a cache
/// directory.
#[derive(Clone)]
pub struct AcmeResolver {
    state: Arc<AcmeState>,
}

impl std::fmt::Debug for AcmeResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcmeResolver")
            .field("dir", &self.state.dir)
            .field("cached", &self.state.certs.len())
            .finish_non_exhaustive()
    }
}

impl AcmeResolver {
    fn new(dir: PathBuf, settings: AcmeConfig) -> Self {
        tls::install_default_provider();
        Self {
            state: Arc::new(AcmeState {
                dir,
                settings,
                account: OnceCell::new(),
                certs: DashMap::new(),
                challenges: DashMap::new(),
                pending: Mutex::new(HashSet::new()),
                retry_after: DashMap::new(),
            }),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.state.dir
    }

    /// Whether an order for `domain` is currently in flight.
    pub fn is_pending(&self, domain: &str) -> bool {
        self.state.pending().contains(domain)
    }

    fn certificate_for(&self, domain: &str) -> Option<Arc<CertifiedKey>> {
        if let Some(cached) = self.state.certs.get(domain) {
            let key = Arc::clone(&cached.key);
            let renew = needs_renewal(cached.not_after);
            drop(cached);
            if renew {
                self.ensure_order(domain);
            }
            return Some(key);
        }

        match self.state.load_from_disk(domain) {
            Ok(Some(cached)) => {
                let key = Arc::clone(&cached.key);
                let renew = needs_renewal(cached.not_after);
                self.state.certs.insert(domain.to_owned(), cached);
                if renew {
                    self.ensure_order(domain);
                }
                Some(key)
            },
            Ok(None) => {
                self.ensure_order(domain);
                None
            },
            Err(e) => {
                warn!(domain, error = %e, "cached certificate unusable, ordering a new one");
                self.ensure_order(domain);
                None
            },
        }
    }

    /// Start a background order for `domain` unless one is already running
    /// or the last one failed recently.
    fn ensure_order(&self, domain: &str) {
        if self.state.backing_off(domain) {
            debug!(domain, "recent order failed, not retrying yet");
            return;
        }
        if !self.state.pending().insert(domain.to_owned()) {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(domain, "no async runtime available, cannot order certificate");
            self.state.pending().remove(domain);
            return;
        };

        let mut order = InFlight {
            state: Arc::clone(&self.state),
            domain: domain.to_owned(),
            issued: false,
        };
        runtime.spawn(async move {
            let (state, domain) = (&order.state, &order.domain);
            info!(domain = %domain, dir = %state.dir.display(), "ordering certificate");
            match state.order_certificate(domain).await {
                Ok(cached) => {
                    info!(domain = %domain, "certificate issued");
                    state.certs.insert(domain.clone(), cached);
                    order.issued = true;
                },
                Err(e) => warn!(domain = %domain, error = %e, "certificate order failed"),
            }
        });
    }
}

/// Clears a domain's in-flight marker however its order task ends,
/// panics included. Anything short of an issued certificate starts the
/// retry backoff.
struct InFlight {
    state: Arc<AcmeState>,
    domain: String,
    issued: bool,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.state.challenges.remove(&self.domain);
        if self.issued {
            self.state.retry_after.remove(&self.domain);
        } else {
            self.state
                .retry_after
                .insert(self.domain.clone(), Instant::now() + RETRY_BACKOFF);
        }
        self.state.pending().remove(&self.domain);
    }
}

impl ResolvesServerCert for AcmeResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let domain = client_hello.server_name()?.to_ascii_lowercase();

        let is_challenge = client_hello
            .alpn()
            .is_some_and(|mut protocols| protocols.any(|p| p == ACME_TLS_ALPN));
        if is_challenge {
            return self
                .state
                .challenges
                .get(&domain)
                .map(|key| Arc::clone(key.value()));
        }

        if let Err(e) = self.state.check_domain(&domain) {
            debug!(error = %e, "refusing handshake");
            return None;
        }

        self.certificate_for(&domain)
    }
}

impl AcmeState {
    fn pending(&self) -> MutexGuard<'_, HashSet<String>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn backing_off(&self, domain: &str) -> bool {
        self.retry_after
            .get(domain)
            .is_some_and(|until| Instant::now() < *until)
    }

    fn check_domain(&self, domain: &str) -> Result<(), AcmeError> {
        let allowed = &self.settings.domains;
        if allowed.is_empty() || allowed.iter().any(|d| d.eq_ignore_ascii_case(domain)) {
            Ok(())
        } else {
            Err(AcmeError::DomainNotAllowed(domain.to_owned()))
        }
    }

    fn cert_path(&self, domain: &str) -> PathBuf {
        self.dir.join(format!("{domain}.crt"))
    }

    fn key_path(&self, domain: &str) -> PathBuf {
        self.dir.join(format!("{domain}.key"))
    }

    /// `Ok(None)` when nothing is cached on disk.
    fn load_from_disk(&self, domain: &str) -> Result<Option<CachedCert>, AcmeError> {
        let cert_path = self.cert_path(domain);
        if !cert_path.exists() {
            return Ok(None);
        }
        let cert_pem = std::fs::read(&cert_path)?;
        let key_pem = std::fs::read(self.key_path(domain))?;
        Ok(Some(cached_cert(&cert_pem, &key_pem, domain)?))
    }

    async fn account(&self) -> Result<Account, AcmeError> {
        let account = self
            .account
            .get_or_try_init(|| self.load_or_create_account())
            .await?;
        Ok(account.clone())
    }

    async fn load_or_create_account(&self) -> Result<Account, AcmeError> {
        let path = self.dir.join(ACCOUNT_FILE);
        match tokio::fs::read(&path).await {
            Ok(raw) => {
                let credentials: AccountCredentials = serde_json::from_slice(&raw)?;
                debug!(path = %path.display(), "loaded ACME account");
                return Ok(Account::from_credentials(credentials).await?);
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
            Err(e) => return Err(e.into()),
        }

        let contact: Vec<&str> = self.settings.contact.iter().map(String::as_str).collect();
        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &contact,
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            &self.settings.directory,
            None,
        )
        .await?;

        tokio::fs::create_dir_all(&self.dir).await?;
        write_private(&path, &serde_json::to_vec_pretty(&credentials)?).await?;
        info!(
            path = %path.display(),
            directory = %self.settings.directory,
            "registered ACME account"
        );
        Ok(account)
    }

    async fn order_certificate(&self, domain: &str) -> Result<CachedCert, AcmeError> {
        self.check_domain(domain)?;
        let account = self.account().await?;

        let identifiers = [Identifier::Dns(domain.to_owned())];
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await?;

        for authz in order.authorizations().await? {
            match authz.status {
                AuthorizationStatus::Pending => {},
                AuthorizationStatus::Valid => continue,
                other => {
                    return Err(AcmeError::Order {
                        domain: domain.to_owned(),
                        status: format!("{other:?}"),
                    });
                },
            }

            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::TlsAlpn01)
                .ok_or_else(|| AcmeError::NoChallenge(domain.to_owned()))?;

            let digest = order.key_authorization(challenge).digest();
            let challenge_key = challenge_certificate(domain, digest.as_ref())?;
            self.challenges
                .insert(domain.to_owned(), Arc::new(challenge_key));
            order.set_challenge_ready(&challenge.url).await?;
        }

        let status = poll_order(&mut order, domain, |s| {
            matches!(s, OrderStatus::Ready | OrderStatus::Invalid | OrderStatus::Valid)
        })
        .await?;
        if status == OrderStatus::Invalid {
            return Err(AcmeError::Order {
                domain: domain.to_owned(),
                status: format!("{status:?}"),
            });
        }

        let key_pair = KeyPair::generate()?;
        if status == OrderStatus::Ready {
            let mut params = CertificateParams::new(vec![domain.to_owned()])?;
            params.distinguished_name = DistinguishedName::new();
            let csr = params.serialize_request(&key_pair)?;
            order.finalize(csr.der().as_ref()).await?;
        }

        let cert_pem = wait_for_certificate(&mut order, domain).await?;
        let key_pem = key_pair.serialize_pem();

        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(self.cert_path(domain), &cert_pem).await?;
        write_private(&self.key_path(domain), key_pem.as_bytes()).await?;

        cached_cert(cert_pem.as_bytes(), key_pem.as_bytes(), domain)
    }
}

async fn poll_order(
    order: &mut Order,
    domain: &str,
    done: impl Fn(&OrderStatus) -> bool,
) -> Result<OrderStatus, AcmeError> {
    let mut delay = POLL_INITIAL_DELAY;
    for _ in 0..POLL_ATTEMPTS {
        let state = order.refresh().await?;
        if done(&state.status) {
            return Ok(state.status);
        }
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(POLL_MAX_DELAY);
    }
    Err(AcmeError::Timeout(domain.to_owned()))
}

async fn wait_for_certificate(order: &mut Order, domain: &str) -> Result<String, AcmeError> {
    let mut delay = POLL_INITIAL_DELAY;
    for _ in 0..POLL_ATTEMPTS {
        if let Some(pem) = order.certificate().await? {
            return Ok(pem);
        }
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(POLL_MAX_DELAY);
    }
    Err(AcmeError::Timeout(domain.to_owned()))
}

/// Self-signed certificate carrying the `acmeIdentifier` extension.
fn challenge_certificate(domain: &str, digest: &[u8]) -> Result<CertifiedKey, AcmeError> {
    let mut params = CertificateParams::new(vec![domain.to_owned()])?;
    params.custom_extensions = vec![CustomExtension::new_acme_identifier(digest)];
    let key_pair = KeyPair::generate()?;
    let cert = params.self_signed(&key_pair)?;

    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
    let chain: Vec<CertificateDer<'static>> = vec![cert.der().clone()];
    Ok(tls::certified_key(chain, &key)?)
}

fn cached_cert(cert_pem: &[u8], key_pem: &[u8], domain: &str) -> Result<CachedCert, AcmeError> {
    let chain = tls::parse_cert_chain(cert_pem, domain)?;
    let not_after = chain.first().and_then(not_after).unwrap_or(0);
    let key = tls::parse_private_key(key_pem, domain)?;
    Ok(CachedCert {
        key: Arc::new(tls::certified_key(chain, &key)?),
        not_after,
    })
}

/// Expiry of a DER certificate as Unix seconds.
fn not_after(der: &CertificateDer<'_>) -> Option<i64> {
    let (_, cert) = x509_parser::parse_x509_certificate(der.as_ref()).ok()?;
    Some(cert.validity().not_after.timestamp())
}

fn needs_renewal(not_after: i64) -> bool {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    not_after - now < RENEW_BEFORE.as_secs() as i64
}

async fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    tokio::fs::write(path, contents).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    }
    Ok(())
}
