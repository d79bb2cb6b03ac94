use crate::claims::{ClaimType, TrustClaim};
use crate::context::{AttachmentDescriptor, VerificationContext};
use crate::plugins::VerifierPlugin;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use base64::prelude::*;
use regex::Regex;
use serde::{Deserialize, Serialize};

pub const NAME: &str = "content-heuristics";

const DANGEROUS_EXTENSIONS: &[&str] = &[
    ".exe", ".scr", ".bat", ".cmd", ".com", ".pif", ".vbs", ".js", ".jar", ".app", ".msi",
    ".run", ".ps1", ".hta", ".lnk", ".iso",
];

const ARCHIVE_TYPES: &[&str] = &[
    "application/zip",
    "application/x-zip",
    "application/x-zip-compressed",
    "application/x-rar-compressed",
    "application/vnd.rar",
];

/// One scam tactic: any matching pattern yields a single claim
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternFamily {
    pub claim_type: ClaimType,
    pub patterns: Vec<String>,
    #[serde(default = "full_confidence")]
    pub confidence: f64,
}

fn full_confidence() -> f64 {
    1.0
}

pub fn default_families() -> Vec<PatternFamily> {
    let family = |claim_type, patterns: &[&str]| PatternFamily {
        claim_type,
        patterns: patterns.iter().map(|p| p.to_string()).collect(),
        confidence: 1.0,
    };

    vec![
        family(
            ClaimType::PayToPitch,
            &[
                r"(?i)\b(feature|listing|publication|placement|submission|reading|review|booking)\s+fee\b",
                r"(?i)\bpay(ing)?\s+(a\s+)?(small\s+)?(fee|deposit)\s+to\s+(be\s+)?(featured|considered|published|listed|interviewed)",
                r"(?i)\b(sponsored|paid)\s+(interview|feature|placement|spot)\b",
                r"(?i)\bguaranteed\s+(placement|coverage|feature|publication)\b",
                r"(?i)\bone[-\s]time\s+(processing|onboarding|registration)\s+fee\b",
            ],
        ),
        family(
            ClaimType::BudgetAnchoring,
            &[
                r"(?i)\bwhat('s| is)\s+your\s+(marketing\s+)?budget\b",
                r"(?i)\b(packages?|plans?|rates?)\s+(start(ing)?|from)\s+(at\s+)?[$€£]\s?\d",
                r"(?i)\b(investment|budget)\s+of\s+(only\s+|just\s+)?[$€£]\s?\d",
                r"(?i)\bonly\s+[$€£]\s?\d[\d,]*(\.\d+)?\s+(per|a|/)\s*(month|year|slot|spot)\b",
            ],
        ),
        family(
            ClaimType::UrgencyLanguage,
            &[
                r"(?i)\b(urgent|immediate(ly)?|act now|expires today|last chance)\b",
                r"(?i)\b(within|in the next)\s+(24|48|72)\s+hours\b",
                r"(?i)\b(only|just)\s+\d+\s+(spots?|slots?|places?|seats?)\s+(left|remaining|available)\b",
                r"(?i)\b(respond|reply|confirm)\s+(by|before)\s+(today|tonight|end of (the )?day|eod)\b",
                r"(?i)\b(offer|invitation|spot)\s+(expires|closes|ends)\b",
            ],
        ),
        family(
            ClaimType::AuthorityGarnish,
            &[
                r"(?i)\b(as\s+)?(seen|featured)\s+(on|in)\s+(forbes|cnn|bbc|the new york times|nyt|bloomberg|tedx?|inc\.?|entrepreneur)\b",
                r"(?i)\b(endorsed|recommended|approved)\s+by\s+(the\s+)?(government|fbi|irs|ministry|harvard|stanford|un\b)",
                r"(?i)\b(official|authori[sz]ed)\s+(partner|agent|representative)\s+of\b",
                r"(?i)\b(award[-\s]winning|world[-\s]renowned|internationally acclaimed)\b",
            ],
        ),
    ]
}

struct CompiledFamily {
    claim_type: ClaimType,
    patterns: Vec<Regex>,
    confidence: f64,
}

/// Pattern-matches message text against known scam tactics and inspects
/// attachments for executables
pub struct ContentHeuristicsPlugin {
    families: Vec<CompiledFamily>,
}

impl ContentHeuristicsPlugin {
    pub fn new() -> Result<Self> {
        Self::from_families(&default_families())
    }

    pub fn from_families(families: &[PatternFamily]) -> Result<Self> {
        let families = families
            .iter()
            .map(|family| {
                let patterns = family
                    .patterns
                    .iter()
                    .map(|p| Regex::new(p).map_err(|e| anyhow!("bad pattern for {}: {e}", family.claim_type)))
                    .collect::<Result<Vec<_>>>()?;
                Ok(CompiledFamily {
                    claim_type: family.claim_type,
                    patterns,
                    confidence: family.confidence.clamp(0.0, 1.0),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { families })
    }

    pub fn evaluate(&self, context: &VerificationContext) -> Vec<TrustClaim> {
        let text = context.searchable_text();
        let mut claims = Vec::new();

        for family in &self.families {
            let matched: Vec<&str> = family
                .patterns
                .iter()
                .filter_map(|re| re.find(&text).map(|m| m.as_str()))
                .collect();
            if matched.is_empty() {
                continue;
            }
            log::debug!("{} matched {} pattern(s)", family.claim_type, matched.len());
            claims.push(
                TrustClaim::new(NAME, family.claim_type, context.sender_address(), family.confidence)
                    .with_evidence(format!("Matched: \"{}\"", matched.join("\", \""))),
            );
        }

        let flagged: Vec<String> = context
            .attachments()
            .iter()
            .flat_map(dangerous_names)
            .collect();
        if !flagged.is_empty() {
            claims.push(
                TrustClaim::new(NAME, ClaimType::SuspiciousAttachment, context.sender_address(), 1.0)
                    .with_evidence(format!("Dangerous attachment content: {}", flagged.join(", "))),
            );
        }

        claims
    }
}

fn is_dangerous(filename: &str) -> bool {
    let lower = filename.to_lowercase();
    DANGEROUS_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

/// Names inside `attachment` that carry an executable extension: the file
/// itself, or filenames visible inside a base64 archive body
fn dangerous_names(attachment: &AttachmentDescriptor) -> Vec<String> {
    if is_dangerous(&attachment.filename) {
        return vec![attachment.filename.clone()];
    }

    let is_archive = ARCHIVE_TYPES.contains(&attachment.content_type.as_str())
        || attachment.filename.to_lowercase().ends_with(".zip")
        || attachment.filename.to_lowercase().ends_with(".rar");
    let Some(content) = attachment.base64_content.as_deref().filter(|_| is_archive) else {
        return Vec::new();
    };
    let Ok(decoded) = BASE64_STANDARD.decode(content) else {
        log::debug!("Attachment {} is not valid base64", attachment.filename);
        return Vec::new();
    };

    let candidates = if decoded.starts_with(ZIP_LOCAL_HEADER) {
        zip_entry_names(&decoded)
    } else {
        rar_name_tokens(&decoded)
    };

    let mut names = Vec::new();
    for entry in candidates {
        let base = entry.rsplit('/').next().unwrap_or(&entry);
        if base.is_empty() || !is_dangerous(base) {
            continue;
        }
        let name = format!("{}:{base}", attachment.filename);
        if !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

const ZIP_LOCAL_HEADER: &[u8] = b"PK\x03\x04";
const ZIP_CENTRAL_HEADER: &[u8] = b"PK\x01\x02";

/// Filenames recorded in zip local-file and central-directory headers.
/// Entry contents are never tokenized.
fn zip_entry_names(data: &[u8]) -> Vec<String> {
    let mut names = Vec::new();
    let mut i = 0;
    while i + 4 <= data.len() {
        // (offset of the name length field, offset of the name)
        let (len_at, name_at) = match &data[i..i + 4] {
            sig if sig == ZIP_LOCAL_HEADER => (26, 30),
            sig if sig == ZIP_CENTRAL_HEADER => (28, 46),
            _ => {
                i += 1;
                continue;
            }
        };
        let Some(len) = data
            .get(i + len_at..i + len_at + 2)
            .map(|b| u16::from_le_bytes([b[0], b[1]]) as usize)
        else {
            break;
        };
        let start = i + name_at;
        let Some(name) = data.get(start..start + len) else {
            break;
        };
        names.push(String::from_utf8_lossy(name).into_owned());
        i = start + len;
    }
    names
}

/// Best-effort name scan for formats without a parser here. `.com` is
/// left out since any domain in stored text would match it.
fn rar_name_tokens(data: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(data)
        .split(|c: char| c.is_control() || c.is_whitespace())
        .map(|token| token.trim_matches(char::REPLACEMENT_CHARACTER))
        .filter(|token| !token.is_empty() && token.len() < 100)
        .filter(|token| !token.to_lowercase().ends_with(".com"))
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl VerifierPlugin for ContentHeuristicsPlugin {
    fn name(&self) -> &str {
        NAME
    }

    fn description(&self) -> &str {
        "Scam tactics in message text (pay-to-pitch, budget anchoring, urgency, authority) and dangerous attachments"
    }

    async fn gather(&self, context: &VerificationContext) -> Result<Vec<TrustClaim>> {
        Ok(self.evaluate(context))
    }
}
