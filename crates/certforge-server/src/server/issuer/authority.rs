use super::{IssuerError, IssuerResult, SigningService, dn::parse_distinguished_name};
use certforge_core::IssuedPair;
use rcgen::{Certificate, CertificateParams, DistinguishedName, DnType, Issuer, KeyPair, SerialNumber};
use rsa::{
    RsaPrivateKey,
    pkcs8::{EncodePrivateKey, LineEnding},
    rand_core::OsRng,
};
use std::path::Path;
use time::{Duration, OffsetDateTime};

/// Smallest RSA modulus accepted for subject keys.
pub const MIN_KEY_BITS: usize = 2048;

/// Largest RSA modulus accepted for subject keys.
pub const MAX_KEY_BITS: usize = 8192;

/// Backdating applied to `notBefore` to tolerate clock skew between peers.
const CLOCK_SKEW: Duration = Duration::seconds(60);

/// Issues RSA subject keys and certificates signed by a fixed issuer.
///
/// The issuer key (RSA or ECDSA, PKCS#8 PEM) and distinguished name are
/// loaded once; every [`issue`](SigningService::issue) call generates a
/// fresh subject key pair.
pub struct RsaIssuer {
    key_bits: usize,
    validity: Duration,
    issuer_params: CertificateParams,
    issuer_key: KeyPair,
}

impl RsaIssuer {
    /// Creates an issuer from an already parsed key.
    ///
    /// # Errors
    ///
    /// Fails if `issuer_dn` cannot be parsed or `key_bits` is outside
    /// [`MIN_KEY_BITS`]..=[`MAX_KEY_BITS`].
    pub fn new(
        issuer_key: KeyPair,
        issuer_dn: &str,
        key_bits: usize,
        validity_days: u32,
    ) -> IssuerResult<Self> {
        if !(MIN_KEY_BITS..=MAX_KEY_BITS).contains(&key_bits) {
            return Err(IssuerError::KeySize(key_bits));
        }

        let mut issuer_params = CertificateParams::default();
        issuer_params.distinguished_name = parse_distinguished_name(issuer_dn)?;

        Ok(Self {
            key_bits,
            validity: Duration::days(i64::from(validity_days)),
            issuer_params,
            issuer_key,
        })
    }

    /// Loads the issuer key from a PKCS#8 PEM file.
    pub fn from_pem_file(
        path: &Path,
        issuer_dn: &str,
        key_bits: usize,
        validity_days: u32,
    ) -> IssuerResult<Self> {
        let pem = std::fs::read_to_string(path).map_err(|source| IssuerError::KeyFile {
            path: path.to_path_buf(),
            source,
        })?;
        let issuer_key = KeyPair::from_pem(&pem).map_err(IssuerError::KeyParse)?;
        Self::new(issuer_key, issuer_dn, key_bits, validity_days)
    }

    /// Generates a fresh RSA key pair of the configured size.
    pub fn generate_key_pair(&self) -> IssuerResult<KeyPair> {
        let private_key = RsaPrivateKey::new(&mut OsRng, self.key_bits)?;
        let pem = private_key.to_pkcs8_pem(LineEnding::LF)?;
        KeyPair::from_pem(&pem).map_err(IssuerError::KeyParse)
    }

    /// Signs a certificate for `CN=<subject>` binding `subject_key`.
    pub fn issue_certificate(&self, subject: &str, subject_key: &KeyPair) -> IssuerResult<Certificate> {
        let mut distinguished_name = DistinguishedName::new();
        distinguished_name.push(DnType::CommonName, subject);

        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name;
        params.serial_number = Some(random_serial());

        let now = OffsetDateTime::now_utc();
        params.not_before = now - CLOCK_SKEW;
        params.not_after = now + self.validity;

        let issuer = Issuer::from_params(&self.issuer_params, &self.issuer_key);
        params
            .signed_by(subject_key, &issuer)
            .map_err(IssuerError::Signing)
    }

    pub const fn key_bits(&self) -> usize {
        self.key_bits
    }
}

impl SigningService for RsaIssuer {
    fn issue(&self, subject: &str) -> IssuerResult<IssuedPair> {
        let key_pair = self.generate_key_pair()?;
        let certificate = self.issue_certificate(subject, &key_pair)?;
        Ok(IssuedPair::new(key_pair.serialize_pem(), certificate.pem()))
    }
}

/// A random, positive 160-bit serial number.
fn random_serial() -> SerialNumber {
    let mut bytes: [u8; 20] = rand::random();
    bytes[0] &= 0x7f;
    SerialNumber::from_slice(&bytes)
}
