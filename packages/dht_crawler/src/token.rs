use std::time::{Duration, Instant};

use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use rand::RngCore;
use sha1::Sha1;

use krpc_encoding::Endpoint;

type HmacSha1 = Hmac<Sha1>;

const SECRET_LEN: usize = 16;
pub const TOKEN_LEN: usize = 20;

/// An opaque capability token handed out in `get_peers` responses and
/// required on a subsequent `announce_peer`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DhtToken {
    pub bytes: [u8; TOKEN_LEN],
}

impl DhtToken {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Parses a token as received in an `announce_peer` query's `"token"`
    /// field. Returns `None` if the length doesn't match what this
    /// `TokenManager` issues, which is never going to `verify()` anyway.
    pub fn from_bytes(bytes: &[u8]) -> Option<DhtToken> {
        if bytes.len() != TOKEN_LEN {
            return None;
        }
        let mut out = [0u8; TOKEN_LEN];
        out.copy_from_slice(bytes);
        Some(DhtToken { bytes: out })
    }
}

struct Secrets {
    current: [u8; SECRET_LEN],
    previous: [u8; SECRET_LEN],
    last_rotation: Instant,
}

fn random_secret() -> [u8; SECRET_LEN] {
    let mut bytes = [0u8; SECRET_LEN];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// C6: issues and verifies endpoint-keyed tokens, rotating the signing
/// secret every [`TokenManager::rotation_interval`]. Tokens generated
/// against the secret in use at time `T` verify for any time up to
/// `T + 2 * rotation_interval` (the outgoing secret is kept one rotation
/// past its retirement as "previous").
pub struct TokenManager {
    secrets: Mutex<Secrets>,
    rotation_interval: Duration,
}

impl TokenManager {
    pub fn new(rotation_interval: Duration) -> TokenManager {
        TokenManager {
            secrets: Mutex::new(Secrets {
                current: random_secret(),
                previous: random_secret(),
                last_rotation: Instant::now(),
            }),
            rotation_interval,
        }
    }

    pub fn rotation_interval(&self) -> Duration {
        self.rotation_interval
    }

    fn maybe_rotate(&self, secrets: &mut Secrets) {
        if secrets.last_rotation.elapsed() >= self.rotation_interval {
            secrets.previous = secrets.current;
            secrets.current = random_secret();
            secrets.last_rotation = Instant::now();
        }
    }

    pub fn generate(&self, endpoint: Endpoint) -> DhtToken {
        let mut secrets = self.secrets.lock();
        self.maybe_rotate(&mut secrets);
        mac_token(&secrets.current, endpoint)
    }

    /// Accepts a token produced against either the current or previous
    /// secret, giving callers a validity window of
    /// `[rotation_interval, 2 * rotation_interval)`.
    pub fn verify(&self, token: &DhtToken, endpoint: Endpoint) -> bool {
        let mut secrets = self.secrets.lock();
        self.maybe_rotate(&mut secrets);
        let current = mac_token(&secrets.current, endpoint);
        let previous = mac_token(&secrets.previous, endpoint);
        constant_time_eq(&token.bytes, &current.bytes) || constant_time_eq(&token.bytes, &previous.bytes)
    }
}

/// Family tag + canonical address bytes + big-endian port, per §4.6.
fn endpoint_bytes(endpoint: Endpoint) -> Vec<u8> {
    let addr = endpoint.socket_addr();
    let mut out = Vec::with_capacity(19);
    match addr.ip() {
        std::net::IpAddr::V4(v4) => {
            out.push(4);
            out.extend_from_slice(&v4.octets());
        }
        std::net::IpAddr::V6(v6) => {
            out.push(6);
            out.extend_from_slice(&v6.octets());
        }
    }
    out.extend_from_slice(&addr.port().to_be_bytes());
    out
}

fn mac_token(secret: &[u8; SECRET_LEN], endpoint: Endpoint) -> DhtToken {
    let mut mac = HmacSha1::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(&endpoint_bytes(endpoint));
    let digest = mac.finalize().into_bytes();
    let mut bytes = [0u8; TOKEN_LEN];
    bytes.copy_from_slice(&digest[..TOKEN_LEN]);
    DhtToken { bytes }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> Endpoint {
        Endpoint::parse("127.0.0.1", 6881).unwrap()
    }

    #[test]
    fn generated_token_verifies_immediately() {
        let manager = TokenManager::new(Duration::from_secs(300));
        let token = manager.generate(endpoint());
        assert!(manager.verify(&token, endpoint()));
    }

    #[test]
    fn token_does_not_verify_for_a_different_endpoint() {
        let manager = TokenManager::new(Duration::from_secs(300));
        let token = manager.generate(endpoint());
        let other = Endpoint::parse("127.0.0.2", 6881).unwrap();
        assert!(!manager.verify(&token, other));
    }

    #[test]
    fn token_survives_one_rotation_but_not_two() {
        // Scenario 4 of spec §8, compressed to a short interval so the test
        // doesn't sleep for minutes.
        let manager = TokenManager::new(Duration::from_millis(20));
        let token = manager.generate(endpoint());

        std::thread::sleep(Duration::from_millis(25));
        assert!(manager.verify(&token, endpoint())); // one rotation: previous secret still accepts

        std::thread::sleep(Duration::from_millis(25));
        assert!(!manager.verify(&token, endpoint())); // two rotations: secret fully retired
    }
}
