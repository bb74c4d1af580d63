//! 8.3 short-name and VFAT long-name codecs (spec.md §4.E, component E).
//!
//! Grounded on the teacher's `entry.rs` — `ShortDirEntry::gen_check_sum`,
//! `is_valid_name`, `name()`/`name_bytes_array`, and `LongDirEntry`'s
//! `write_unicode`/`name_to_utf8` — but pulled out of those `#[repr(packed)]`
//! methods into free functions that operate on plain byte buffers, since
//! spec.md §4.F's directory cursor needs to build and check names before it
//! has committed to a slot layout, and independent testability is the point
//! of splitting this out as its own module at all.

/// The space character FAT pads short names with.
const SPACE: u8 = b' ';

/// Bytes allowed anywhere in an 8.3 name, per spec.md §4.E's allow-set:
/// uppercase ASCII letters, digits, and `$ % ' - _ @ ~ \` ! ( ) { } ^ # &`.
/// Anything else — lowercase, space, punctuation outside this set, and any
/// byte `>= 0x80` — is out of the short-name charset and routes the name
/// through LFN instead.
fn is_legal_sfn_byte(b: u8) -> bool {
    b.is_ascii_uppercase()
        || b.is_ascii_digit()
        || matches!(
            b,
            b'$' | b'%' | b'\'' | b'-' | b'_' | b'@' | b'~' | b'`' | b'!' | b'(' | b')' | b'{'
                | b'}' | b'^' | b'#' | b'&'
        )
}

/// Whether `name` can be stored verbatim as an 8.3 short name: at most 8
/// base characters, at most one `.`, at most 3 extension characters, every
/// byte in the allow-set. `.` and `..` are explicitly 8.3 (spec.md §4.E).
pub fn is_8_3(name: &str) -> bool {
    if name == "." || name == ".." {
        return true;
    }
    if name.is_empty() {
        return false;
    }
    let (base, ext) = split_base_ext(name);
    if base.is_empty() || base.len() > 8 || ext.len() > 3 {
        return false;
    }
    base.bytes().all(is_legal_sfn_byte) && ext.bytes().all(is_legal_sfn_byte)
}

fn split_base_ext(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(i) if i > 0 => (&name[..i], &name[i + 1..]),
        _ => (name, ""),
    }
}

/// Encode an already-validated 8.3 name (see [`is_8_3`]) into the packed
/// 11-byte `name[8] + ext[3]` form, space-padded.
pub fn encode_8_3(name: &str) -> [u8; 11] {
    let (base, ext) = split_base_ext(name);
    let mut out = [SPACE; 11];
    out[..base.len()].copy_from_slice(base.as_bytes());
    out[8..8 + ext.len()].copy_from_slice(ext.as_bytes());
    // 0xE5 is the free-slot marker; a real leading character that value is
    // stored as 0x05 instead (the one Kanji lead-byte exception, spec.md §3).
    if out[0] == 0xE5 {
        out[0] = 0x05;
    }
    out
}

/// Decode the packed 11-byte short name back into a displayable `"NAME.EXT"`
/// string (lowercased the way a shell displays it; the on-disk bytes stay
/// uppercase per the format).
pub fn decode_8_3(raw: &[u8; 11]) -> String {
    let mut name_byte0 = raw[0];
    if name_byte0 == 0x05 {
        name_byte0 = 0xE5;
    }
    let base_len = raw[1..8]
        .iter()
        .position(|&b| b == SPACE)
        .map(|p| p + 1)
        .unwrap_or(8);
    let ext_len = raw[8..11].iter().position(|&b| b == SPACE).unwrap_or(3);

    let mut out = String::with_capacity(12);
    out.push(name_byte0 as char);
    for &b in &raw[1..base_len] {
        out.push(b as char);
    }
    if ext_len > 0 {
        out.push('.');
        for &b in &raw[8..8 + ext_len] {
            out.push(b as char);
        }
    }
    out
}

/// The standard FAT short-name checksum, stamped into every long-name
/// entry in a set so an orphaned LFN chain can be detected (spec.md §4.E,
/// §4.F). Grounded verbatim on the teacher's `gen_check_sum`.
pub fn checksum_name(raw: &[u8; 11]) -> u8 {
    let mut sum: u8 = 0;
    for &b in raw {
        sum = ((sum & 1) << 7).wrapping_add(sum >> 1).wrapping_add(b);
    }
    sum
}

/// Whether `name` needs VFAT long-name entries: anything that isn't already
/// a valid 8.3 name, including names with mixed case, too-long components,
/// or characters the short-name charset forbids.
pub fn needs_lfn(name: &str) -> bool {
    !is_8_3(name)
}

/// Split a long name into UTF-16 13-character chunks for a run of
/// `LongDirEntry`s, in on-disk storage order (the *last* logical chunk is
/// entry 1 of the set; callers reverse for `ord` assignment). Pads the final
/// chunk with one NUL terminator then `0xFFFF` filler, per spec.md §3 — the
/// teacher's `write_unicode`.
pub fn split_lfn_chunks(name: &str) -> Vec<[u16; 13]> {
    let units: Vec<u16> = name.encode_utf16().collect();
    let mut chunks = Vec::new();
    let mut i = 0;
    while i < units.len() || chunks.is_empty() {
        let mut chunk = [0xFFFFu16; 13];
        let remaining = units.len() - i;
        let take = remaining.min(13);
        chunk[..take].copy_from_slice(&units[i..i + take]);
        if take < 13 {
            chunk[take] = 0x0000;
        }
        chunks.push(chunk);
        i += take;
        if take < 13 {
            break;
        }
    }
    chunks
}

/// Reassemble a long name from its chunks, in logical (first-to-last)
/// order, stopping at the NUL terminator or the end of content. Grounded on
/// the teacher's `name_to_utf8`, generalized to decode straight into a
/// `String` via `char::decode_utf16` instead of a hand-rolled UTF-8 encoder.
pub fn decode_lfn_chunks(chunks: &[[u16; 13]]) -> String {
    let mut units = Vec::with_capacity(chunks.len() * 13);
    'outer: for chunk in chunks {
        for &u in chunk {
            if u == 0x0000 {
                break 'outer;
            }
            if u == 0xFFFF {
                continue;
            }
            units.push(u);
        }
    }
    char::decode_utf16(units)
        .map(|r| r.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect()
}

/// Produce the next `~N` numeric-tail short name basis for a long name that
/// collides with an existing short name, per spec.md §4.E. `n` is 1-based;
/// the generated base truncates the original name to make room for `~n`
/// (never more than 8 characters total) and keeps the first 3 extension
/// characters uppercased, non-dot, non-space.
pub fn numeric_tail_basis(name: &str, n: u32) -> [u8; 11] {
    let (base, ext) = split_base_ext(name);
    let suffix = format!("~{n}");
    let stripped: String = base
        .chars()
        .map(|c| c.to_ascii_uppercase())
        .filter(|c| is_legal_sfn_byte(*c as u8))
        .collect();
    let keep = stripped.len().min(8usize.saturating_sub(suffix.len()));
    let mut basis = String::with_capacity(8);
    basis.push_str(&stripped[..keep]);
    basis.push_str(&suffix);

    let mut out = [SPACE; 11];
    out[..basis.len().min(8)].copy_from_slice(basis.as_bytes());
    let ext_clean: String = ext
        .chars()
        .map(|c| c.to_ascii_uppercase())
        .filter(|c| is_legal_sfn_byte(*c as u8))
        .take(3)
        .collect();
    out[8..8 + ext_clean.len()].copy_from_slice(ext_clean.as_bytes());
    out
}
