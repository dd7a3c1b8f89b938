//! Per-domain TLS state mutated by keymgr responses.
//!
//! The handshake machinery itself lives outside this crate; what the
//! message handlers install here is the material the TLS subsystem reads
//! when (re)building a domain's context: the certificate chain, the CRL
//! payload and an optional TLS-ALPN-01 challenge certificate.

/// How certificate bytes should be interpreted when a context is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertSource {
    /// A PEM certificate chain, the normal keymgr payload.
    PemChain,
    /// A single DER certificate, used for ACME challenge certs.
    DerData,
}

/// The installed material behind a domain's TLS context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsContext {
    pub source: CertSource,
    pub chain: Vec<u8>,
    pub crl: Option<Vec<u8>>,
}

#[derive(Debug)]
pub struct Domain {
    name: String,
    ctx: Option<TlsContext>,
    acme_cert: Vec<u8>,
    acme_challenge: bool,
}

impl Domain {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ctx: None,
            acme_cert: Vec::new(),
            acme_challenge: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ctx(&self) -> Option<&TlsContext> {
        self.ctx.as_ref()
    }

    /// (Re)initialize the TLS context from certificate bytes.
    ///
    /// Idempotent: the same payload always yields the same context state.
    /// A previously installed CRL belongs to the old chain and is dropped
    /// with it.
    pub fn tls_init(&mut self, source: CertSource, data: &[u8]) {
        self.ctx = Some(TlsContext {
            source,
            chain: data.to_vec(),
            crl: None,
        });
    }

    /// Install a CRL payload into the existing context.
    pub fn crl_install(&mut self, data: &[u8]) -> bool {
        match self.ctx.as_mut() {
            Some(ctx) => {
                ctx.crl = Some(data.to_vec());
                true
            }
            None => false,
        }
    }

    /// Arm the TLS-ALPN-01 challenge with a DER certificate, lazily
    /// building a context when the domain has none yet.
    pub fn acme_challenge_set(&mut self, data: &[u8]) {
        if self.ctx.is_none() {
            self.tls_init(CertSource::DerData, data);
        }
        self.acme_cert = data.to_vec();
        self.acme_challenge = true;
    }

    pub fn acme_challenge_clear(&mut self) {
        self.acme_cert.clear();
        self.acme_challenge = false;
    }

    pub fn acme_challenge(&self) -> bool {
        self.acme_challenge
    }

    pub fn acme_cert_len(&self) -> usize {
        self.acme_cert.len()
    }
}

/// The domains this process serves, looked up by name on every keymgr
/// response; a response naming an unknown domain is dropped by the caller.
#[derive(Debug, Default)]
pub struct DomainMap {
    domains: Vec<Domain>,
}

impl DomainMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str) {
        if self.lookup(name).is_none() {
            self.domains.push(Domain::new(name));
        }
    }

    pub fn lookup(&self, name: &str) -> Option<&Domain> {
        self.domains.iter().find(|d| d.name == name)
    }

    pub fn lookup_mut(&mut self, name: &str) -> Option<&mut Domain> {
        self.domains.iter_mut().find(|d| d.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Domain> {
        self.domains.iter()
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tls_init_idempotent() {
        let mut domain = Domain::new("example.com");
        domain.tls_init(CertSource::PemChain, b"chain");
        let first = domain.ctx().cloned();
        domain.tls_init(CertSource::PemChain, b"chain");
        assert_eq!(domain.ctx().cloned(), first);
    }

    #[test]
    fn test_tls_reinit_drops_stale_crl() {
        let mut domain = Domain::new("example.com");
        domain.tls_init(CertSource::PemChain, b"old");
        assert!(domain.crl_install(b"crl"));
        domain.tls_init(CertSource::PemChain, b"new");
        assert_eq!(domain.ctx().unwrap().crl, None);
    }

    #[test]
    fn test_crl_requires_ctx() {
        let mut domain = Domain::new("example.com");
        assert!(!domain.crl_install(b"crl"));
    }

    #[test]
    fn test_acme_set_clear_restores() {
        let mut domain = Domain::new("example.com");

        // regardless of prior state: fresh domain
        domain.acme_challenge_set(b"der");
        domain.acme_challenge_clear();
        assert_eq!(domain.acme_cert_len(), 0);
        assert!(!domain.acme_challenge());

        // and with a pre-existing context and armed challenge
        domain.tls_init(CertSource::PemChain, b"chain");
        domain.acme_challenge_set(b"der2");
        domain.acme_challenge_set(b"der3");
        domain.acme_challenge_clear();
        assert_eq!(domain.acme_cert_len(), 0);
        assert!(!domain.acme_challenge());
    }

    #[test]
    fn test_acme_set_lazily_builds_ctx() {
        let mut domain = Domain::new("example.com");
        domain.acme_challenge_set(b"der");
        let ctx = domain.ctx().unwrap();
        assert_eq!(ctx.source, CertSource::DerData);
        assert_eq!(ctx.chain, b"der");

        // an existing chain context is left alone
        let mut domain = Domain::new("example.org");
        domain.tls_init(CertSource::PemChain, b"chain");
        domain.acme_challenge_set(b"der");
        assert_eq!(domain.ctx().unwrap().source, CertSource::PemChain);
    }

    #[test]
    fn test_map_lookup() {
        let mut map = DomainMap::new();
        map.insert("a.example");
        map.insert("b.example");
        map.insert("a.example");
        assert_eq!(map.len(), 2);
        assert!(map.lookup("a.example").is_some());
        assert!(map.lookup("c.example").is_none());
    }
}
