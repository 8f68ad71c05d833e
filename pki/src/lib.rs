//! The embedded certificate authority behind the agent channel.
//!
//! A root certificate is generated once at install time and persisted only
//! in sealed (encrypted) form; server and agent leaves are minted from it on
//! demand. The private key PEM never leaves the process unencrypted.

mod seal;

use std::net::IpAddr;

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType, PKCS_ECDSA_P256_SHA256,
};

pub use seal::SealedBundle;

/// Root certificates outlive everything else on the installation.
const ROOT_VALIDITY_DAYS: i64 = 3650;

/// Leaves are short-lived and re-issued on provision.
const LEAF_VALIDITY_DAYS: i64 = 365;

const ORGANIZATION: &str = "paasdeploy";

#[derive(Debug, thiserror::Error)]
pub enum PkiError {
    #[error("failed to issue certificate: {0}")]
    CertIssue(String),
    #[error("failed to seal CA material")]
    Seal,
    #[error("failed to open sealed CA material: wrong master key or corrupt blob")]
    Open,
}

pub type Result<T> = std::result::Result<T, PkiError>;

/// A freshly minted leaf: certificate chain and private key, PEM encoded.
#[derive(Clone, Debug)]
pub struct IssuedCert {
    pub cert_pem: String,
    pub key_pem: String,
}

/// The root CA. Holds the signing key in memory for the lifetime of the
/// process; persistence goes through [`CertAuthority::seal`].
pub struct CertAuthority {
    root: Certificate,
    root_pem: String,
}

impl CertAuthority {
    /// Generate a new P-256 root, self-signed, valid for ten years.
    pub fn generate() -> Result<Self> {
        let mut params = CertificateParams::new(vec![]);
        params.alg = &PKCS_ECDSA_P256_SHA256;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "paasdeploy root ca");
        dn.push(DnType::OrganizationName, ORGANIZATION);
        params.distinguished_name = dn;

        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
        ];

        let now = time::OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + time::Duration::days(ROOT_VALIDITY_DAYS);

        let root = Certificate::from_params(params)
            .map_err(|e| PkiError::CertIssue(e.to_string()))?;
        let root_pem = root
            .serialize_pem()
            .map_err(|e| PkiError::CertIssue(e.to_string()))?;

        Ok(Self { root, root_pem })
    }

    /// Rebuild the authority from previously persisted PEMs.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let key_pair =
            KeyPair::from_pem(key_pem).map_err(|e| PkiError::CertIssue(e.to_string()))?;
        let params = CertificateParams::from_ca_cert_pem(cert_pem, key_pair)
            .map_err(|e| PkiError::CertIssue(e.to_string()))?;
        let root = Certificate::from_params(params)
            .map_err(|e| PkiError::CertIssue(e.to_string()))?;

        Ok(Self {
            root,
            root_pem: cert_pem.to_string(),
        })
    }

    /// The root certificate PEM, as handed to TLS trust stores.
    pub fn root_cert_pem(&self) -> &str {
        &self.root_pem
    }

    /// Issue the control plane's server certificate: valid for the
    /// configured hostname plus localhost, server auth only.
    pub fn issue_server(&self, hostname: &str) -> Result<IssuedCert> {
        let mut params = leaf_params(hostname);
        params.subject_alt_names = vec![
            SanType::DnsName(hostname.to_string()),
            SanType::DnsName("localhost".to_string()),
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        self.sign(params)
    }

    /// Issue an agent leaf. The agent serves the control plane's dials and
    /// dials back for heartbeats, so the leaf carries both usages. A literal
    /// IP address becomes an IP SAN, anything else a DNS SAN.
    pub fn issue_agent(&self, host_id: &str, address: &str) -> Result<IssuedCert> {
        let mut params = leaf_params(host_id);
        params.subject_alt_names = vec![match address.parse::<IpAddr>() {
            Ok(ip) => SanType::IpAddress(ip),
            Err(_) => SanType::DnsName(address.to_string()),
        }];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ClientAuth,
            ExtendedKeyUsagePurpose::ServerAuth,
        ];

        self.sign(params)
    }

    fn sign(&self, params: CertificateParams) -> Result<IssuedCert> {
        let leaf = Certificate::from_params(params)
            .map_err(|e| PkiError::CertIssue(e.to_string()))?;
        let cert_pem = leaf
            .serialize_pem_with_signer(&self.root)
            .map_err(|e| PkiError::CertIssue(e.to_string()))?;
        let key_pem = leaf.serialize_private_key_pem();

        Ok(IssuedCert { cert_pem, key_pem })
    }

    /// Encrypt the CA pair for persistence under the operator master key.
    pub fn seal(&self, master_key: &str) -> Result<SealedBundle> {
        seal::seal(
            self.root_cert_pem(),
            &self.root.serialize_private_key_pem(),
            master_key,
        )
    }

    /// Decrypt a persisted bundle and rebuild the authority from it.
    pub fn open(sealed: &SealedBundle, master_key: &str) -> Result<Self> {
        let (cert_pem, key_pem) = seal::open(sealed, master_key)?;
        Self::from_pem(&cert_pem, &key_pem)
    }
}

fn leaf_params(common_name: &str) -> CertificateParams {
    let mut params = CertificateParams::new(vec![]);
    params.alg = &PKCS_ECDSA_P256_SHA256;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn.push(DnType::OrganizationName, ORGANIZATION);
    params.distinguished_name = dn;

    let now = time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + time::Duration::days(LEAF_VALIDITY_DAYS);

    params
}

#[cfg(test)]
mod tests {
    use x509_parser::prelude::*;

    use super::CertAuthority;

    fn parse(pem: &str) -> x509_parser::pem::Pem {
        let (_, parsed) = x509_parser::pem::parse_x509_pem(pem.as_bytes()).unwrap();
        parsed
    }

    #[test]
    fn server_leaf_verifies_against_issuing_root() {
        let ca = CertAuthority::generate().unwrap();
        let leaf = ca.issue_server("deploy.example.com").unwrap();

        let root_pem = parse(ca.root_cert_pem());
        let root = root_pem.parse_x509().unwrap();
        let leaf_pem = parse(&leaf.cert_pem);
        let leaf = leaf_pem.parse_x509().unwrap();

        assert!(leaf.verify_signature(Some(root.public_key())).is_ok());
    }

    #[test]
    fn leaf_fails_against_foreign_root() {
        let ca = CertAuthority::generate().unwrap();
        let other = CertAuthority::generate().unwrap();
        let leaf = ca.issue_server("deploy.example.com").unwrap();

        let other_pem = parse(other.root_cert_pem());
        let other_root = other_pem.parse_x509().unwrap();
        let leaf_pem = parse(&leaf.cert_pem);
        let leaf = leaf_pem.parse_x509().unwrap();

        assert!(leaf.verify_signature(Some(other_root.public_key())).is_err());
    }

    #[test]
    fn server_leaf_sans_and_usage() {
        let ca = CertAuthority::generate().unwrap();
        let leaf = ca.issue_server("deploy.example.com").unwrap();

        let leaf_pem = parse(&leaf.cert_pem);
        let cert = leaf_pem.parse_x509().unwrap();

        let san = cert
            .subject_alternative_name()
            .unwrap()
            .expect("server leaf should carry SANs");
        let names: Vec<_> = san
            .value
            .general_names
            .iter()
            .filter_map(|n| match n {
                GeneralName::DNSName(name) => Some(*name),
                _ => None,
            })
            .collect();
        assert!(names.contains(&"deploy.example.com"));
        assert!(names.contains(&"localhost"));

        let eku = cert.extended_key_usage().unwrap().unwrap();
        assert!(eku.value.server_auth);
        assert!(!eku.value.client_auth);
    }

    #[test]
    fn agent_leaf_ip_address_becomes_ip_san() {
        let ca = CertAuthority::generate().unwrap();
        let leaf = ca.issue_agent("host-1", "10.0.0.7").unwrap();

        let leaf_pem = parse(&leaf.cert_pem);
        let cert = leaf_pem.parse_x509().unwrap();

        let san = cert.subject_alternative_name().unwrap().unwrap();
        let has_ip = san
            .value
            .general_names
            .iter()
            .any(|n| matches!(n, GeneralName::IPAddress(bytes) if *bytes == [10, 0, 0, 7]));
        assert!(has_ip);

        let eku = cert.extended_key_usage().unwrap().unwrap();
        assert!(eku.value.server_auth);
        assert!(eku.value.client_auth);
    }

    #[test]
    fn agent_leaf_hostname_becomes_dns_san() {
        let ca = CertAuthority::generate().unwrap();
        let leaf = ca.issue_agent("host-1", "agent.internal").unwrap();

        let leaf_pem = parse(&leaf.cert_pem);
        let cert = leaf_pem.parse_x509().unwrap();

        let san = cert.subject_alternative_name().unwrap().unwrap();
        let has_dns = san
            .value
            .general_names
            .iter()
            .any(|n| matches!(n, GeneralName::DNSName(name) if *name == "agent.internal"));
        assert!(has_dns);
    }

    #[test]
    fn seal_open_round_trip() {
        let ca = CertAuthority::generate().unwrap();
        let sealed = ca.seal("correct horse battery staple").unwrap();

        let reopened = CertAuthority::open(&sealed, "correct horse battery staple").unwrap();
        assert_eq!(reopened.root_cert_pem(), ca.root_cert_pem());

        // A leaf issued by the reopened authority chains to the same root.
        let leaf = reopened.issue_server("deploy.example.com").unwrap();
        let root_pem = parse(ca.root_cert_pem());
        let root = root_pem.parse_x509().unwrap();
        let leaf_pem = parse(&leaf.cert_pem);
        let leaf = leaf_pem.parse_x509().unwrap();
        assert!(leaf.verify_signature(Some(root.public_key())).is_ok());
    }

    #[test]
    fn wrong_master_key_fails_to_open() {
        let ca = CertAuthority::generate().unwrap();
        let sealed = ca.seal("right key").unwrap();

        assert!(CertAuthority::open(&sealed, "wrong key").is_err());
    }
}
