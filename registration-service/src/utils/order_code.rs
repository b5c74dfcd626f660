//! Human-readable order codes: random Crockford base32 body plus a Luhn mod 32
//! check character, so a mistyped code is rejected before touching the database.

use rand::Rng;

const ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";
const BODY_LEN: usize = 8;

pub const ORDER_CODE_LEN: usize = BODY_LEN + 1;

fn index_of(c: u8) -> Option<u32> {
    ALPHABET
        .iter()
        .position(|&a| a == c.to_ascii_uppercase())
        .map(|i| i as u32)
}

fn check_char(body: &[u8]) -> Option<u8> {
    let n = ALPHABET.len() as u32;
    let mut factor = 2;
    let mut sum = 0;

    for &c in body.iter().rev() {
        let mut addend = factor * index_of(c)?;
        factor = if factor == 2 { 1 } else { 2 };
        addend = addend / n + addend % n;
        sum += addend;
    }

    let check = (n - sum % n) % n;
    Some(ALPHABET[check as usize])
}

/// Generate a fresh order code. Uniqueness is enforced by the database.
pub fn generate() -> String {
    let mut rng = rand::thread_rng();
    let mut code: Vec<u8> = (0..BODY_LEN)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())])
        .collect();

    // Every body character is drawn from the alphabet, so the check always exists.
    if let Some(check) = check_char(&code) {
        code.push(check);
    }

    String::from_utf8(code).unwrap_or_default()
}

/// Case-insensitive structural check of an order code.
pub fn is_valid(code: &str) -> bool {
    let bytes = code.as_bytes();
    if bytes.len() != ORDER_CODE_LEN {
        return false;
    }
    let (body, check) = bytes.split_at(BODY_LEN);
    check_char(body).is_some_and(|expected| expected == check[0].to_ascii_uppercase())
}

/// Canonical form used for storage and lookup.
pub fn normalize(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}
