//! The legacy UserChoice hash.
//!
//! The shell stores a 64-bit keyed checksum next to every UserChoice ProgId.
//! The checksum input is
//!
//! ```text
//! lower(target ++ sid ++ prog_id ++ %08x(ft.high) ++ %08x(ft.low) ++ USER_EXPERIENCE) ++ NUL
//! ```
//!
//! encoded as UTF-16LE, where `ft` is the record's last-write FILETIME with
//! seconds cleared. MD5 of those bytes seeds two multiply/halfword-swap
//! schedules that run over the same bytes; the XOR of both is base64 encoded.

use std::time::SystemTime;

use crate::digest::{Digest128, Md5Digest};
use crate::error::Failure;
use crate::filetime::FileTime;

/// Built into the shell's hash routine. No known way to derive it; if a
/// Windows build changes it, generated hashes stop verifying.
pub const USER_EXPERIENCE: &str =
    "User Choice set via Windows User Experience {D18B6DD5-6124-4341-9318-804003BAFA0B}";

const WORDS_PER_BLOCK: usize = 2;

/// Multipliers applied after the seed in schedule 0, one row per word of a block.
const SCHEDULE_0: [[u32; 4]; WORDS_PER_BLOCK] = [
    [0xCF98_B111, 0x8708_5B9F, 0x12CE_B96D, 0x257E_1D83],
    [0xA274_16F5, 0xD383_96FF, 0x7C93_2B89, 0xBFA4_9F69],
];

/// Multipliers applied after the seed in schedule 1, one row per word of a block.
const SCHEDULE_1: [[u32; 4]; WORDS_PER_BLOCK] = [
    [0xEF05_69FB, 0x689B_6B9F, 0x79F8_A395, 0xC3EF_EA97],
    [0xC317_13DB, 0xDDCD_1F0F, 0x59C3_AF2D, 0x35BD_1EC9],
];

/// Builds the lowercased hash input (without the terminator).
pub fn format_canonical_string(
    target: &str,
    sid: &str,
    prog_id: &str,
    timestamp: SystemTime,
) -> Result<String, Failure> {
    let ft = FileTime::from_system_time(timestamp)?.truncate_to_minute();
    Ok(format_canonical_string_at(target, sid, prog_id, ft))
}

/// Same as [`format_canonical_string`] for a FILETIME read from the registry.
pub fn format_canonical_string_at(target: &str, sid: &str, prog_id: &str, ft: FileTime) -> String {
    let ft = ft.truncate_to_minute();
    let input = format!(
        "{}{}{}{:08x}{:08x}{}",
        target, sid, prog_id, ft.high_date_time, ft.low_date_time, USER_EXPERIENCE
    );
    char_lower(&input)
}

/// Per-character lowercase like `CharLowerW`: a character whose lowercase
/// form is not a single character is left alone, so the UTF-16 length never
/// changes.
fn char_lower(s: &str) -> String {
    s.chars()
        .map(|c| {
            let mut lower = c.to_lowercase();
            match (lower.next(), lower.next()) {
                (Some(l), None) => l,
                _ => c,
            }
        })
        .collect()
}

/// UTF-16LE bytes of `s` followed by a NUL code unit. The terminator is
/// hashed too.
pub fn utf16le_with_terminator(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity((s.len() + 1) * 2);
    for u in s.encode_utf16().chain(std::iter::once(0)) {
        out.extend_from_slice(&u.to_le_bytes());
    }
    out
}

/// Little-endian 32-bit words of `bytes`; a trailing partial word is dropped.
pub fn le_words(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

#[inline]
fn word_swap(v: u32) -> u32 {
    v.rotate_left(16)
}

/// The two-schedule checksum. `words` is consumed two at a time; an odd
/// trailing word is ignored. Returns `h0 ^ h1` and `h0_acc ^ h1_acc` as two
/// little-endian words.
pub fn scramble(words: &[u32], seed0: u32, seed1: u32) -> Result<[u8; 8], Failure> {
    if words.len() < WORDS_PER_BLOCK {
        return Err(Failure::InputTooShort);
    }
    let seeds = [seed0 | 1, seed1 | 1];

    let mut h0: u32 = 0;
    let mut h1: u32 = 0;
    let mut h0_acc: u32 = 0;
    let mut h1_acc: u32 = 0;

    for block in words.chunks_exact(WORDS_PER_BLOCK) {
        for (j, &input) in block.iter().enumerate() {
            let c0 = &SCHEDULE_0[j];
            let c1 = &SCHEDULE_1[j];

            h0 = h0.wrapping_add(input);
            h0 = h0.wrapping_mul(seeds[j]);
            h0 = word_swap(h0).wrapping_mul(c0[0]);
            h0 = word_swap(h0).wrapping_mul(c0[1]);
            h0 = word_swap(h0).wrapping_mul(c0[2]);
            h0 = word_swap(h0).wrapping_mul(c0[3]);
            h0_acc = h0_acc.wrapping_add(h0);

            h1 = h1.wrapping_add(input);
            h1 = word_swap(h1)
                .wrapping_mul(c1[0])
                .wrapping_add(h1.wrapping_mul(seeds[j]));
            h1 = (h1 >> 16)
                .wrapping_mul(c1[1])
                .wrapping_add(h1.wrapping_mul(c1[2]));
            h1 = word_swap(h1).wrapping_mul(c1[3]).wrapping_add(h1);
            h1_acc = h1_acc.wrapping_add(h1);
        }
    }

    let mut out = [0u8; 8];
    out[0..4].copy_from_slice(&(h0 ^ h1).to_le_bytes());
    out[4..8].copy_from_slice(&(h0_acc ^ h1_acc).to_le_bytes());
    Ok(out)
}

/// Standard alphabet with padding, no line breaks (`CRYPT_STRING_BASE64 |
/// CRYPT_STRING_NOCRLF`). The shell compares the stored text ordinally.
pub fn encode_base64(bytes: &[u8]) -> Result<String, Failure> {
    use base64::Engine;

    let len = base64::encoded_len(bytes.len(), true).ok_or(Failure::EncodingFailed)?;
    let mut buf = vec![0u8; len];
    let written = base64::engine::general_purpose::STANDARD
        .encode_slice(bytes, &mut buf)
        .map_err(|_| Failure::EncodingFailed)?;
    buf.truncate(written);
    String::from_utf8(buf).map_err(|_| Failure::EncodingFailed)
}

/// Runs the hash pipeline with a chosen digest provider.
#[derive(Debug, Default, Clone)]
pub struct UserChoiceHasher<D = Md5Digest> {
    digest: D,
}

impl<D: Digest128> UserChoiceHasher<D> {
    pub fn with_digest(digest: D) -> Self {
        Self { digest }
    }

    pub fn generate(
        &self,
        target: &str,
        sid: &str,
        prog_id: &str,
        timestamp: SystemTime,
    ) -> Result<String, Failure> {
        let input = format_canonical_string(target, sid, prog_id, timestamp)?;
        self.hash_string(&input)
    }

    /// Hash for a record whose last-write time came straight from the registry.
    pub fn generate_at(
        &self,
        target: &str,
        sid: &str,
        prog_id: &str,
        last_write: FileTime,
    ) -> Result<String, Failure> {
        let input = format_canonical_string_at(target, sid, prog_id, last_write);
        self.hash_string(&input)
    }

    /// Hashes an already formatted (and lowercased) input string.
    pub fn hash_string(&self, input: &str) -> Result<String, Failure> {
        let bytes = utf16le_with_terminator(input);
        let words = le_words(&bytes);
        if words.len() < WORDS_PER_BLOCK {
            return Err(Failure::InputTooShort);
        }

        let md5 = self.digest.digest128(&bytes)?;
        let seed0 = u32::from_le_bytes([md5[0], md5[1], md5[2], md5[3]]);
        let seed1 = u32::from_le_bytes([md5[4], md5[5], md5[6], md5[7]]);

        let checksum = scramble(&words, seed0, seed1)?;
        encode_base64(&checksum)
    }
}

/// `GenerateUserChoiceHash` with the portable MD5 provider.
pub fn generate_hash(
    target: &str,
    sid: &str,
    prog_id: &str,
    timestamp: SystemTime,
) -> Result<String, Failure> {
    UserChoiceHasher::<Md5Digest>::default().generate(target, sid, prog_id, timestamp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    const SID_500: &str = "S-1-5-21-819709642-920330688-1657285119-500";
    const SID_1001: &str = "S-1-5-21-463486358-3398762107-1964875780-1001";

    fn at(ticks: u64) -> FileTime {
        FileTime::from_u64(ticks)
    }

    // 2019-03-13 09:52:00 UTC
    fn captured_time() -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(1_552_470_720)
    }

    fn hasher() -> UserChoiceHasher {
        UserChoiceHasher::default()
    }

    #[test]
    fn hash_vector_3g2() {
        let hash = hasher()
            .generate_at(".3g2", SID_500, "WMP11.AssocFile.3G2", at(0x01d4d98267246000))
            .unwrap();
        assert_eq!(hash, "PCCqEmkvW2Y=");
    }

    #[test]
    fn hash_vector_txtfile() {
        let hash = hasher()
            .generate_at(".txt", SID_1001, "txtfile", at(0x01d3442a29887400))
            .unwrap();
        assert_eq!(hash, "PGINlytwZJo=");
    }

    #[test]
    fn hash_vector_mp4_potplayer() {
        let hash = hasher()
            .generate_at(".mp4", SID_1001, "PotPlayer.mp4", at(0x01d4d98267246000))
            .unwrap();
        assert_eq!(hash, "bqwC5h8a7rY=");
    }

    // Regression pin computed by this implementation, not captured from the
    // shell. The .3g2/.txt/.mp4 vectors above are the ground truth.
    #[test]
    fn hash_vector_http_protocol() {
        let hash = generate_hash("http", SID_1001, "BraveHTML", captured_time()).unwrap();
        assert_eq!(hash, "2S6w31kEuDk=");
    }

    #[test]
    fn system_time_and_filetime_entry_points_agree() {
        let from_time = generate_hash(".3g2", SID_500, "WMP11.AssocFile.3G2", captured_time());
        assert_eq!(from_time.unwrap(), "PCCqEmkvW2Y=");
    }

    #[test]
    fn generate_is_deterministic() {
        let a = generate_hash("https", SID_500, "ChromeHTML", captured_time()).unwrap();
        let b = generate_hash("https", SID_500, "ChromeHTML", captured_time()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, "oaBHPs5IaQA=");
    }

    #[test]
    fn seconds_and_subseconds_do_not_change_the_hash() {
        let base = generate_hash("http", SID_1001, "BraveHTML", captured_time()).unwrap();
        for offset in [
            Duration::from_nanos(100),
            Duration::from_millis(999),
            Duration::from_secs(30),
            Duration::new(59, 999_999_900),
        ] {
            let shifted =
                generate_hash("http", SID_1001, "BraveHTML", captured_time() + offset).unwrap();
            assert_eq!(shifted, base, "offset {:?}", offset);
        }
    }

    #[test]
    fn changing_any_input_changes_the_hash() {
        let base = generate_hash("http", SID_1001, "BraveHTML", captured_time()).unwrap();
        let variants = [
            generate_hash("https", SID_1001, "BraveHTML", captured_time()),
            generate_hash("http", SID_500, "BraveHTML", captured_time()),
            generate_hash("http", SID_1001, "BraveHTMM", captured_time()),
            generate_hash("http", SID_1001, "BraveHTML", captured_time() + Duration::from_secs(60)),
            generate_hash("http", SID_1001, "BraveHTML", captured_time() - Duration::from_secs(3600)),
        ];
        for v in variants {
            assert_ne!(v.unwrap(), base);
        }
    }

    #[test]
    fn input_case_is_folded() {
        let upper = generate_hash("HTTP", &SID_1001.to_uppercase(), "BRAVEHTML", captured_time());
        let lower = generate_hash("http", SID_1001, "bravehtml", captured_time());
        assert_eq!(upper.unwrap(), lower.unwrap());
    }

    #[test]
    fn canonical_string_layout() {
        let s = format_canonical_string("HTTP", "S-1-5-21-1", "Brave.HTML", captured_time()).unwrap();
        assert_eq!(
            s,
            "https-1-5-21-1brave.html01d4d98267246000user choice set via windows user experience {d18b6dd5-6124-4341-9318-804003bafa0b}"
        );
    }

    #[test]
    fn canonical_string_zero_pads_each_filetime_word() {
        let s = format_canonical_string_at("x", "", "", at(0x0000_0001_0000_00ff));
        // 0x1_000000ff rounds down to a whole minute before formatting.
        let ft = at(0x0000_0001_0000_00ff).truncate_to_minute();
        let expected = format!("x{:08x}{:08x}", ft.high_date_time, ft.low_date_time);
        assert!(s.starts_with(&expected));
        assert_eq!(&s[1..9], "00000000");
    }

    #[test]
    fn canonical_string_rejects_unrepresentable_time() {
        let too_early = UNIX_EPOCH - Duration::from_secs(11_644_473_601);
        assert_eq!(
            format_canonical_string("http", "sid", "prog", too_early),
            Err(Failure::TimestampConversionFailed)
        );
    }

    #[test]
    fn char_lower_keeps_utf16_length() {
        // U+0130 lowercases to two characters; CharLowerW maps it to itself.
        let s = "A\u{0130}B";
        let lowered = char_lower(s);
        assert_eq!(lowered, "a\u{0130}b");
        assert_eq!(lowered.encode_utf16().count(), s.encode_utf16().count());
    }

    #[test]
    fn terminator_is_part_of_the_bytes() {
        assert_eq!(utf16le_with_terminator("ab"), vec![b'a', 0, b'b', 0, 0, 0]);
        assert_eq!(utf16le_with_terminator(""), vec![0, 0]);
    }

    #[test]
    fn le_words_drop_partial_trailing_word() {
        assert_eq!(le_words(&[1, 0, 0, 0, 2, 0, 0, 0, 3, 0]), vec![1, 2]);
    }

    #[test]
    fn scramble_rejects_less_than_one_block() {
        assert_eq!(scramble(&[], 1, 1), Err(Failure::InputTooShort));
        assert_eq!(scramble(&[0x1234], 1, 1), Err(Failure::InputTooShort));
    }

    #[test]
    fn scramble_ignores_trailing_partial_block() {
        let full = scramble(&[1, 2, 3, 4], 0x1111, 0x2222).unwrap();
        let with_tail = scramble(&[1, 2, 3, 4, 5], 0x1111, 0x2222).unwrap();
        assert_eq!(full, with_tail);
    }

    #[test]
    fn scramble_forces_odd_seeds() {
        let even = scramble(&[7, 9], 0x10, 0x20).unwrap();
        let odd = scramble(&[7, 9], 0x11, 0x21).unwrap();
        assert_eq!(even, odd);
    }

    #[test]
    fn hash_string_rejects_input_below_one_block() {
        // "a" + NUL is four bytes: a single word.
        assert_eq!(hasher().hash_string("a"), Err(Failure::InputTooShort));
        // "abc" + NUL is eight bytes: exactly one block.
        assert!(hasher().hash_string("abc").is_ok());
    }

    #[test]
    fn base64_output_decodes_to_checksum() {
        use base64::Engine;

        let checksum = scramble(&[0xdead_beef, 0x0bad_f00d, 42, 43], 3, 5).unwrap();
        let text = encode_base64(&checksum).unwrap();
        assert_eq!(text.len(), 12);
        assert!(text.ends_with('='));
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(&text)
            .unwrap();
        assert_eq!(decoded, checksum);
    }

    #[test]
    fn base64_keeps_padding() {
        assert_eq!(encode_base64(b"").unwrap(), "");
        assert_eq!(encode_base64(b"f").unwrap(), "Zg==");
        assert_eq!(encode_base64(b"fo").unwrap(), "Zm8=");
        assert_eq!(encode_base64(b"foo").unwrap(), "Zm9v");
    }

    struct BrokenDigest;

    impl Digest128 for BrokenDigest {
        fn digest128(&self, _bytes: &[u8]) -> Result<[u8; 16], Failure> {
            Err(Failure::DigestUnavailable("provider missing".to_string()))
        }
    }

    #[test]
    fn digest_failure_short_circuits() {
        let hasher = UserChoiceHasher::with_digest(BrokenDigest);
        assert_eq!(
            hasher.generate("http", SID_1001, "BraveHTML", captured_time()),
            Err(Failure::DigestUnavailable("provider missing".to_string()))
        );
    }
}
