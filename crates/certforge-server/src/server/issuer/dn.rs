use super::{IssuerError, IssuerResult};
use rcgen::{DistinguishedName, DnType};

/// Parses an issuer distinguished name such as `CN=Example CA,O=Example,C=US`.
///
/// Attributes are comma separated `KEY=VALUE` pairs; `\,` escapes a literal
/// comma inside a value. Supported keys (case-insensitive): `CN`, `O`, `OU`,
/// `C`, `ST`, `L`. Each may appear at most once.
pub fn parse_distinguished_name(raw: &str) -> IssuerResult<DistinguishedName> {
    let mut dn = DistinguishedName::new();
    let mut attributes = 0;

    for component in split_unescaped(raw) {
        let component = component.trim();
        if component.is_empty() {
            continue;
        }
        let (key, value) = component
            .split_once('=')
            .ok_or_else(|| IssuerError::InvalidDn(format!("missing '=' in {component:?}")))?;
        let value = value.trim();
        if value.is_empty() {
            return Err(IssuerError::InvalidDn(format!(
                "empty value for {}",
                key.trim()
            )));
        }
        let ty = dn_type(key.trim())?;
        // One value per attribute type; a second would silently replace the first.
        if dn.get(&ty).is_some() {
            return Err(IssuerError::InvalidDn(format!(
                "repeated attribute {}",
                key.trim()
            )));
        }
        dn.push(ty, value);
        attributes += 1;
    }

    if attributes == 0 {
        return Err(IssuerError::InvalidDn("no attributes".to_string()));
    }
    Ok(dn)
}

fn dn_type(key: &str) -> IssuerResult<DnType> {
    match key.to_ascii_uppercase().as_str() {
        "CN" => Ok(DnType::CommonName),
        "O" => Ok(DnType::OrganizationName),
        "OU" => Ok(DnType::OrganizationalUnitName),
        "C" => Ok(DnType::CountryName),
        "ST" => Ok(DnType::StateOrProvinceName),
        "L" => Ok(DnType::LocalityName),
        _ => Err(IssuerError::InvalidDn(format!(
            "unsupported attribute {key:?}"
        ))),
    }
}

fn split_unescaped(raw: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some(next) => current.push(next),
                None => current.push('\\'),
            },
            ',' => parts.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    parts.push(current);
    parts
}
