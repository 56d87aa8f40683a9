//! Operation and connection tokens

use std::fmt;

/// Token length in bytes
pub const TOKEN_LEN: usize = 16;

/// Controller-assigned identifier of one logical operation.
///
/// Compared byte-for-byte; used directly as a map key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Token(pub [u8; TOKEN_LEN]);

/// Identifier minted by a server session for one accepted or incoming peer.
///
/// Lives in its own namespace: never interchangeable with [`Token`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ConnectionToken(pub [u8; TOKEN_LEN]);

macro_rules! token_impl {
    ($name:ident) => {
        impl $name {
            /// Build from a slice; `None` unless exactly 16 bytes
            pub fn from_slice(bytes: &[u8]) -> Option<Self> {
                <[u8; TOKEN_LEN]>::try_from(bytes).ok().map(Self)
            }

            /// Raw bytes
            pub fn as_bytes(&self) -> &[u8; TOKEN_LEN] {
                &self.0
            }

            /// Lowercase hex rendering
            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }
        }

        impl From<[u8; TOKEN_LEN]> for $name {
            fn from(bytes: [u8; TOKEN_LEN]) -> Self {
                Self(bytes)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }
    };
}

token_impl!(Token);
token_impl!(ConnectionToken);

impl ConnectionToken {
    /// Fresh random connection token
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().into_bytes())
    }
}

impl From<Token> for ConnectionToken {
    /// Connectionless sessions address their datagrams with their own token
    fn from(token: Token) -> Self {
        Self(token.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_from_slice_requires_exact_length() {
        assert!(Token::from_slice(&[0u8; 15]).is_none());
        assert!(Token::from_slice(&[0u8; 17]).is_none());
        assert_eq!(Token::from_slice(&[7u8; 16]), Some(Token([7u8; 16])));
    }

    #[test]
    fn test_hex_is_case_exact_key() {
        let mut a = [0u8; 16];
        a[0] = 0xAB;
        let token = Token(a);
        assert_eq!(token.to_hex(), "ab000000000000000000000000000000");
    }

    #[test]
    fn test_random_connection_tokens_are_distinct() {
        let tokens: HashSet<_> = (0..1000).map(|_| ConnectionToken::random()).collect();
        assert_eq!(tokens.len(), 1000);
    }
}
