use bytes::Bytes;

/// A freshly issued private key and certificate, both PEM encoded.
///
/// The buffers are reference counted so the same pair can be handed to every
/// connection that asked for the subject without copying.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IssuedPair {
    pub private_key: Bytes,
    pub certificate: Bytes,
}

impl IssuedPair {
    pub fn new(private_key: impl Into<Bytes>, certificate: impl Into<Bytes>) -> Self {
        Self {
            private_key: private_key.into(),
            certificate: certificate.into(),
        }
    }
}
