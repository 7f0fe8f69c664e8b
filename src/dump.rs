//! Reference dumps
//!
//! A dump is a text file with one zero-padded binary line per word, most
//! significant bit first. Dumps of a correct run are compared line by line
//! against dumps written by a simulation testbench.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{MapError, MapResult};
use crate::hardware::{AcceleratorConfig, Port};
use crate::status::StatusRegister;
use crate::stream::WirePayload;
use crate::verify::CapturedStream;

/// Render words as zero-padded binary lines
pub fn format_dump(words: &[u64], width: u32) -> String {
    let width = width as usize;
    let mut text = String::with_capacity(words.len() * (width + 1));
    for word in words {
        text.push_str(&format!("{:0width$b}\n", word, width = width));
    }
    text
}

/// Parse dump text; blank lines are ignored
pub fn parse_dump(text: &str) -> MapResult<Vec<u64>> {
    text.lines()
        .enumerate()
        .map(|(i, line)| (i, line.trim()))
        .filter(|(_, line)| !line.is_empty())
        .map(|(i, line)| {
            u64::from_str_radix(line, 2)
                .map_err(|_| MapError::stream(format!("dump line {} is not a binary word: '{}'", i + 1, line)))
        })
        .collect()
}

pub fn write_dump(path: &Path, words: &[u64], width: u32) -> MapResult<()> {
    fs::write(path, format_dump(words, width))?;
    debug!(path = %path.display(), words = words.len(), "wrote dump");
    Ok(())
}

pub fn read_dump(path: &Path) -> MapResult<Vec<u64>> {
    parse_dump(&fs::read_to_string(path)?)
}

/// First line at which two dumps disagree (1-based), `None` past the end of
/// the shorter one
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpDifference {
    pub line: usize,
    pub expected: Option<u64>,
    pub actual: Option<u64>,
}

pub fn first_difference(expected: &[u64], actual: &[u64]) -> Option<DumpDifference> {
    (0..expected.len().max(actual.len()))
        .map(|i| DumpDifference {
            line: i + 1,
            expected: expected.get(i).copied(),
            actual: actual.get(i).copied(),
        })
        .find(|d| d.expected != d.actual)
}

pub fn compare_dump_files(expected: &Path, actual: &Path) -> MapResult<Option<DumpDifference>> {
    Ok(first_difference(&read_dump(expected)?, &read_dump(actual)?))
}

/// Decode the status words at the head of a serial dump
pub fn decode_status(words: &[u64]) -> MapResult<StatusRegister> {
    StatusRegister::from_dma_words(words)
}

/// Write the dumps of one repetition into `dir`
///
/// Parallel payloads get a status file and one file per non-empty lane,
/// serial payloads a single file of DMA words. The expected output, if any,
/// goes to `rep<r>_psum_out.txt`. Returns the written paths.
pub fn write_repetition_dumps(
    dir: &Path,
    config: &AcceleratorConfig,
    payload: &WirePayload,
    expected_output: Option<&CapturedStream>,
) -> MapResult<Vec<PathBuf>> {
    let r = payload.repetition();
    let mut written = Vec::new();
    let mut emit = |name: String, words: &[u64], width: u32| -> MapResult<()> {
        let path = dir.join(name);
        write_dump(&path, words, width)?;
        written.push(path);
        Ok(())
    };

    match payload {
        WirePayload::Parallel(tx) => {
            emit(format!("rep{}_status.txt", r), &tx.status.to_dma_words(config)?, config.dma_bits)?;
            for port in Port::ALL {
                for (lane, words) in tx.lanes(port).iter().enumerate() {
                    if !words.is_empty() {
                        emit(format!("rep{}_{}_lane{}.txt", r, port, lane), words, port.trans_bits(config))?;
                    }
                }
            }
        }
        WirePayload::Serial { words, .. } => {
            emit(format!("rep{}_serial.txt", r), words, config.dma_bits)?;
        }
    }

    match expected_output {
        Some(CapturedStream::Parallel(lanes)) => {
            let words: Vec<u64> = lanes.iter().flatten().copied().collect();
            emit(format!("rep{}_psum_out.txt", r), &words, Port::Psum.trans_bits(config))?;
        }
        Some(CapturedStream::Serial(words)) => {
            emit(format!("rep{}_psum_out.txt", r), words, config.dma_bits)?;
        }
        None => {}
    }
    Ok(written)
}
