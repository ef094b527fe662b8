//! RSA key generation and self-signing.

use std::net::{IpAddr, Ipv4Addr};

use rand::rngs::OsRng;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose, SanType, SerialNumber,
};
use rsa::{
    pkcs1::{EncodeRsaPrivateKey, LineEnding},
    pkcs8::EncodePrivateKey,
    RsaPrivateKey,
};
use time::{macros::datetime, OffsetDateTime};

use super::ProvisionError;

/// Modulus size of generated keys.
pub const RSA_KEY_BITS: usize = 2048;

/// Expiry of every generated certificate.
pub const NOT_AFTER: OffsetDateTime = datetime!(2049-12-31 23:59:59 UTC);

/// A freshly generated key and the certificate it signed, both PEM encoded.
pub struct CredentialBundle {
    /// `CERTIFICATE` PEM block.
    pub cert_pem: String,
    /// `RSA PRIVATE KEY` PEM block (PKCS#1).
    pub key_pem: Vec<u8>,
    /// Serial number written into the certificate.
    pub serial: u64,
}

impl Drop for CredentialBundle {
    fn drop(&mut self) {
        self.key_pem.iter_mut().for_each(|b| *b = 0);
    }
}

impl std::fmt::Debug for CredentialBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialBundle")
            .field("serial", &self.serial)
            .field("key_pem", &"[REDACTED]")
            .finish()
    }
}

/// Generate a 2048-bit RSA key and a certificate self-signed with it.
///
/// The serial is the whole-second Unix time of `now`, so two bundles generated
/// within the same second share a serial.
///
/// # Errors
///
/// Returns a [`ProvisionError`] if key generation, certificate construction,
/// or PEM encoding fails.
pub fn generate(
    hosts: &[String],
    organization: &str,
    now: OffsetDateTime,
) -> Result<CredentialBundle, ProvisionError> {
    let private_key = RsaPrivateKey::new(&mut OsRng, RSA_KEY_BITS)
        .map_err(|e| ProvisionError::KeyGeneration(e.to_string()))?;

    // rcgen signs with the PKCS#8 form; the key file carries the PKCS#1 form.
    let pkcs8_pem = private_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| ProvisionError::Encoding(format!("private key as PKCS#8: {e}")))?;
    let key_pair = KeyPair::from_pem(&pkcs8_pem)?;

    let serial = serial_for(now);
    let params = certificate_params(hosts, organization, now, serial)?;
    let cert = params.self_signed(&key_pair)?;

    let key_pem = private_key
        .to_pkcs1_pem(LineEnding::LF)
        .map_err(|e| ProvisionError::Encoding(format!("private key as PKCS#1: {e}")))?;

    Ok(CredentialBundle {
        cert_pem: cert.pem(),
        key_pem: key_pem.as_bytes().to_vec(),
        serial,
    })
}

fn serial_for(now: OffsetDateTime) -> u64 {
    now.unix_timestamp().max(1) as u64
}

fn certificate_params(
    hosts: &[String],
    organization: &str,
    now: OffsetDateTime,
    serial: u64,
) -> Result<CertificateParams, ProvisionError> {
    let mut params = CertificateParams::default();
    params.serial_number = Some(SerialNumber::from_slice(&minimal_be_bytes(serial)));
    params.not_before = now;
    params.not_after = NOT_AFTER;
    params.is_ca = IsCa::NoCa;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, organization);
    params.distinguished_name = dn;

    // Every host is a DNS name, even ones that look like addresses.
    for host in hosts {
        params
            .subject_alt_names
            .push(SanType::DnsName(host.as_str().try_into()?));
    }
    params
        .subject_alt_names
        .push(SanType::IpAddress(IpAddr::V4(Ipv4Addr::UNSPECIFIED)));

    params.key_usages = vec![
        KeyUsagePurpose::KeyEncipherment,
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    Ok(params)
}

fn minimal_be_bytes(value: u64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let first = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len() - 1);
    bytes[first..].to_vec()
}
