//! Weight file parser - 重みファイルの読み込み
//!
//! ```text
//! # comment
//! www.example.org
//! 192.168.1.14 20
//! 192.168.1.15 10
//! ```
//!
//! A one-token line opens a domain, a two-token line adds an address
//! with its weight (1..=255) to the current domain.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;

use thiserror::Error;

use crate::selector::{Selector, SelectionMode};

/// Weight assigned to an address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeightItem {
    pub address: IpAddr,
    pub value: u8,
}

/// Domain name -> weights in file order, as read from the weight file
pub type ParsedWeights = HashMap<String, Vec<WeightItem>>;

#[derive(Debug, Error)]
pub enum WeightError {
    #[error("weight file open error: {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("wrong domain name \"{name}\" in weight file {file} line {line} (maybe a missing weight value?)")]
    DomainLooksLikeIp { file: String, line: usize, name: String },
    #[error("missing domain name in weight file {file} line {line}: \"{content}\"")]
    MissingDomain { file: String, line: usize, content: String },
    #[error("wrong IP address \"{value}\" in weight file {file} line {line}")]
    InvalidAddress { file: String, line: usize, value: String },
    #[error("wrong weight value \"{value}\" in weight file {file} line {line}")]
    InvalidWeight { file: String, line: usize, value: String },
    #[error("could not parse weight line \"{content}\" in weight file {file} line {line}")]
    MalformedLine { file: String, line: usize, content: String },
    #[error("weight file {file} parsing error: {reason}")]
    Scan { file: String, reason: String },
}

impl WeightError {
    /// The source could not be opened (as opposed to a content problem)
    pub fn is_open(&self) -> bool {
        matches!(self, WeightError::Open { .. })
    }
}

/// Add the root label if it is missing. Names are case-insensitive.
pub fn normalize_domain(name: &str) -> String {
    let mut name = name.to_lowercase();
    if !name.ends_with('.') {
        name.push('.');
    }
    name
}

/// Parse raw weight file bytes. `file` identifies the source in errors.
pub fn parse_weight_bytes(data: &[u8], file: &str) -> Result<ParsedWeights, WeightError> {
    let text = std::str::from_utf8(data).map_err(|e| WeightError::Scan {
        file: file.to_string(),
        reason: e.to_string(),
    })?;
    parse_weights(text, file)
}

/// Parse weight file contents. The first violation aborts the whole parse.
pub fn parse_weights(text: &str, file: &str) -> Result<ParsedWeights, WeightError> {
    let mut domains = ParsedWeights::new();
    let mut current: Option<String> = None;

    for (idx, raw_line) in text.lines().enumerate() {
        let line = idx + 1;
        let content = raw_line.trim();
        if content.is_empty() || content.starts_with('#') {
            continue;
        }

        let fields: Vec<&str> = content.split_whitespace().collect();
        match fields.as_slice() {
            [name] => {
                if name.parse::<IpAddr>().is_ok() {
                    return Err(WeightError::DomainLooksLikeIp {
                        file: file.to_string(),
                        line,
                        name: name.to_string(),
                    });
                }
                let name = normalize_domain(name);
                // a repeated header keeps appending to the same domain
                domains.entry(name.clone()).or_default();
                current = Some(name);
            }
            [address, weight] => {
                let address: IpAddr = address.parse().map_err(|_| WeightError::InvalidAddress {
                    file: file.to_string(),
                    line,
                    value: address.to_string(),
                })?;
                let value = parse_weight_value(weight).ok_or_else(|| WeightError::InvalidWeight {
                    file: file.to_string(),
                    line,
                    value: weight.to_string(),
                })?;
                let Some(name) = current.as_ref() else {
                    return Err(WeightError::MissingDomain {
                        file: file.to_string(),
                        line,
                        content: content.to_string(),
                    });
                };
                domains.entry(name.clone()).or_default().push(WeightItem { address, value });
            }
            _ => {
                return Err(WeightError::MalformedLine {
                    file: file.to_string(),
                    line,
                    content: content.to_string(),
                });
            }
        }
    }

    Ok(domains)
}

/// Plain decimal digits only, 1..=255
fn parse_weight_value(s: &str) -> Option<u8> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    match s.parse::<u8>() {
        Ok(0) | Err(_) => None,
        Ok(v) => Some(v),
    }
}

/// Per domain weights and the expected top entry in the next answer
#[derive(Debug, Clone)]
pub struct Domain {
    /// Sorted by weight, highest first; ties keep file order
    pub weights: Vec<WeightItem>,
    pub top: Option<IpAddr>,
    pub selector: Selector,
}

impl Domain {
    pub fn new(mut weights: Vec<WeightItem>, mode: SelectionMode) -> Self {
        // sort_by is stable, equal weights stay in file order
        weights.sort_by(|a, b| b.value.cmp(&a.value));
        let selector = Selector::new(mode, &weights);
        Self {
            weights,
            top: None,
            selector,
        }
    }

    pub fn weight_sum(&self) -> u32 {
        self.weights.iter().map(|w| w.value as u32).sum()
    }
}
