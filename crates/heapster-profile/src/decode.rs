//! Decoder for the emitted profile format.
//!
//! The binary block is otherwise write-only; the decoder lets tests
//! and downstream tooling verify that a profile round-trips. It only
//! understands profiles produced on a machine of the same pointer
//! width and byte order, which is the format's stated limitation.

use crate::{PROFILE_HEADER, WORD};
use anyhow::{anyhow, bail, Context};
use heapster_host::MethodId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    /// `(method id, symbol)` pairs from the symbol block, in emission
    /// order.
    pub symbols: Vec<(MethodId, String)>,
    /// One record per site, in emission order.
    pub records: Vec<ProfileRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileRecord {
    pub num_bytes: usize,
    pub frames: Vec<MethodId>,
}

pub fn decode(data: &[u8]) -> anyhow::Result<Profile> {
    let mut rest = data;

    expect_line(&mut rest, "--- symbol")?;
    expect_line(&mut rest, "binary=heapster")?;

    let mut symbols = Vec::new();
    loop {
        let line = take_line(&mut rest)?;
        if line == "---" {
            break;
        }
        let (addr, symbol) = line
            .split_once(' ')
            .ok_or_else(|| anyhow!("malformed symbol line {line:?}"))?;
        let addr = addr
            .strip_prefix("0x")
            .ok_or_else(|| anyhow!("symbol address {addr:?} lacks 0x prefix"))?;
        let addr = usize::from_str_radix(addr, 16)
            .with_context(|| format!("bad symbol address in line {line:?}"))?;
        symbols.push((MethodId(addr), symbol.to_string()));
    }

    expect_line(&mut rest, "--- profile")?;
    for expected in PROFILE_HEADER {
        let word = take_word(&mut rest)?;
        if word != expected {
            bail!("unexpected profile header word {word} (wanted {expected})");
        }
    }

    let mut records = Vec::new();
    while !rest.is_empty() {
        let num_bytes = take_word(&mut rest)?;
        let nframes = take_word(&mut rest)?;
        let mut frames = Vec::with_capacity(nframes);
        for _ in 0..nframes {
            frames.push(MethodId(take_word(&mut rest)?));
        }
        records.push(ProfileRecord { num_bytes, frames });
    }

    Ok(Profile { symbols, records })
}

fn take_line<'a>(rest: &mut &'a [u8]) -> anyhow::Result<&'a str> {
    let end = rest
        .iter()
        .position(|&b| b == b'\n')
        .ok_or_else(|| anyhow!("truncated text block"))?;
    let line = std::str::from_utf8(&rest[..end]).context("symbol block is not UTF-8")?;
    *rest = &rest[end + 1..];
    Ok(line)
}

fn expect_line(rest: &mut &[u8], expected: &str) -> anyhow::Result<()> {
    let line = take_line(rest)?;
    if line != expected {
        bail!("expected {expected:?}, found {line:?}");
    }
    Ok(())
}

fn take_word(rest: &mut &[u8]) -> anyhow::Result<usize> {
    if rest.len() < WORD {
        bail!("truncated profile block");
    }
    let (word, tail) = rest.split_at(WORD);
    *rest = tail;
    Ok(usize::from_ne_bytes(word.try_into().unwrap()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(values: &[usize]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_ne_bytes()).collect()
    }

    #[test]
    fn rejects_bad_magic() {
        let err = decode(b"--- wrong\n").unwrap_err();
        assert!(err.to_string().contains("--- symbol"));
    }

    #[test]
    fn rejects_bad_header_words() {
        let mut data = b"--- symbol\nbinary=heapster\n---\n--- profile\n".to_vec();
        data.extend(words(&[9, 9, 9, 9, 9]));
        assert!(decode(&data).is_err());
    }

    #[test]
    fn rejects_truncated_record() {
        let mut data = b"--- symbol\nbinary=heapster\n---\n--- profile\n".to_vec();
        data.extend(words(&[0, 3, 0, 1, 0]));
        // A record claiming two frames but carrying none.
        data.extend(words(&[64, 2]));
        assert!(decode(&data).is_err());
    }

    #[test]
    fn decodes_symbols_and_records() {
        let mut data = format!(
            "--- symbol\nbinary=heapster\n{:#0w$x} LFoo;bar\n---\n--- profile\n",
            0x1040usize,
            w = 2 + WORD * 2
        )
        .into_bytes();
        data.extend(words(&[0, 3, 0, 1, 0]));
        data.extend(words(&[64, 1, 0x1040]));

        let profile = decode(&data).unwrap();
        assert_eq!(
            profile.symbols,
            vec![(MethodId(0x1040), "LFoo;bar".to_string())]
        );
        assert_eq!(
            profile.records,
            vec![ProfileRecord {
                num_bytes: 64,
                frames: vec![MethodId(0x1040)],
            }]
        );
    }
}
