//! Participant ID Generation and Parsing
//!
//! Generates the stable per-device identifier sent with join requests.

use std::fmt;

/// Characters used in participant IDs (unambiguous, uppercase)
/// Excludes: 0/O, 1/I/L, 5/S, 2/Z to avoid confusion
const ALPHABET: &[u8] = b"346789ABCDEFGHJKMNPQRTUVWXY";

/// ID length (16 chars = ~79 bits with a 27-char alphabet)
const ID_LENGTH: usize = 16;

/// Group size used when displaying an ID
const GROUP: usize = 4;

/// Stable per-device participant identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ParticipantId(String);

impl ParticipantId {
    /// Generate a random ID using a cryptographically secure RNG
    pub fn random() -> Self {
        use rand::Rng;
        let mut rng = rand::thread_rng();

        let mut id = String::with_capacity(ID_LENGTH);
        for _ in 0..ID_LENGTH {
            let idx = rng.gen_range(0..ALPHABET.len());
            id.push(ALPHABET[idx] as char);
        }
        ParticipantId(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse an ID, ignoring separators and case
    pub fn parse(input: &str) -> Option<Self> {
        let normalized: String = input
            .chars()
            .filter(|c| c.is_alphanumeric())
            .map(|c| c.to_ascii_uppercase())
            .collect();

        if normalized.len() != ID_LENGTH {
            return None;
        }

        if normalized.bytes().all(|b| ALPHABET.contains(&b)) {
            Some(ParticipantId(normalized))
        } else {
            None
        }
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // XXXX-XXXX-XXXX-XXXX
        let groups: Vec<&str> = (0..self.0.len())
            .step_by(GROUP)
            .map(|i| &self.0[i..(i + GROUP).min(self.0.len())])
            .collect();
        write!(f, "{}", groups.join("-"))
    }
}
