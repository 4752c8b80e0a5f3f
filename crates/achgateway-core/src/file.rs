//! ACH document model and NACHA-subset codec.
//!
//! Documents are fixed-width 94-character record files: a file header (`1`),
//! batch headers (`5`), entry details (`6`), batch controls (`8`), a file
//! control (`9`), and `9`-filler lines padding the file to ten-record blocks.
//!
//! The decoder is lenient: control records and addenda are accepted and
//! ignored, and only the fields the gateway operates on are retained. The
//! encoder recomputes batch and file controls (entry counts, entry hash,
//! debit/credit totals) so a re-encoded document is always internally
//! consistent.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Record length for every NACHA line.
pub const RECORD_LENGTH: usize = 94;

/// Records per block; files are padded with `9`-filler to a block boundary.
const BLOCKING_FACTOR: usize = 10;

/// File header record (`1`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FileHeader {
    /// Routing number of the receiving point, right-justified in ten
    /// characters on the wire.
    pub immediate_destination: String,
    /// Routing number (or company identifier) of the sending point.
    pub immediate_origin: String,
    /// File creation date, `YYMMDD`.
    pub file_creation_date: String,
    /// File creation time, `HHMM`.
    pub file_creation_time: String,
    /// Distinguishes multiple files built the same day (`A`–`Z`, `0`–`9`).
    pub file_id_modifier: String,
    /// Name of the receiving point.
    pub immediate_destination_name: String,
    /// Name of the sending point.
    pub immediate_origin_name: String,
}

/// Batch header record (`5`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BatchHeader {
    /// Service class code: 200 mixed, 220 credits only, 225 debits only.
    pub service_class_code: u16,
    /// Originating company name.
    pub company_name: String,
    /// Originating company identification.
    pub company_identification: String,
    /// Standard entry class code, e.g. `PPD` or `CCD`.
    pub standard_entry_class: String,
    /// Entry description shown on receiver statements.
    pub entry_description: String,
    /// Effective entry date, `YYMMDD`.
    pub effective_entry_date: String,
    /// Originator status code; `1` for ODFI-originated entries.
    pub originator_status: String,
    /// First eight digits of the ODFI routing number.
    pub odfi_identification: String,
    /// Sequential batch number within the file.
    pub batch_number: u32,
}

impl BatchHeader {
    /// Returns true when two headers describe the same logical batch,
    /// ignoring the positional batch number.
    #[must_use]
    pub fn matches(&self, other: &Self) -> bool {
        self.service_class_code == other.service_class_code
            && self.company_name == other.company_name
            && self.company_identification == other.company_identification
            && self.standard_entry_class == other.standard_entry_class
            && self.entry_description == other.entry_description
            && self.effective_entry_date == other.effective_entry_date
            && self.originator_status == other.originator_status
            && self.odfi_identification == other.odfi_identification
    }
}

/// Entry detail record (`6`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EntryDetail {
    /// Transaction code; codes ending 0–4 are credits, 5–9 are debits.
    pub transaction_code: u8,
    /// First eight digits of the RDFI routing number.
    pub rdfi_identification: String,
    /// Check digit of the RDFI routing number.
    pub check_digit: String,
    /// Receiver account number at the RDFI.
    pub dfi_account_number: String,
    /// Amount in cents.
    pub amount: u64,
    /// Receiver identification assigned by the originator.
    pub individual_identification: String,
    /// Receiver name.
    pub individual_name: String,
    /// Payment-related discretionary data.
    pub discretionary_data: String,
    /// Number of addenda records following this entry; always zero here.
    pub addenda_record_indicator: u8,
    /// Unique trace number: eight-digit ODFI prefix plus sequence.
    pub trace_number: u64,
}

impl EntryDetail {
    /// Returns true when the transaction code moves funds out of the
    /// receiver's account.
    #[must_use]
    pub const fn is_debit(&self) -> bool {
        self.transaction_code % 10 >= 5
    }
}

/// A batch: one header plus its entry details.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Batch {
    /// Batch header.
    pub header: BatchHeader,
    /// Entry details in file order.
    pub entries: Vec<EntryDetail>,
}

impl Batch {
    fn debit_total(&self) -> u64 {
        self.entries
            .iter()
            .filter(|e| e.is_debit())
            .map(|e| e.amount)
            .sum()
    }

    fn credit_total(&self) -> u64 {
        self.entries
            .iter()
            .filter(|e| !e.is_debit())
            .map(|e| e.amount)
            .sum()
    }

    fn entry_hash(&self) -> u64 {
        let sum: u64 = self
            .entries
            .iter()
            .map(|e| e.rdfi_identification.trim().parse::<u64>().unwrap_or(0))
            .sum();
        sum % 10_000_000_000
    }
}

/// A parsed ACH document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AchFile {
    /// File header.
    pub header: FileHeader,
    /// Batches in file order.
    pub batches: Vec<Batch>,
}

impl AchFile {
    /// Total entry details across all batches.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.batches.iter().map(|b| b.entries.len()).sum()
    }

    /// Sum of debit amounts in cents.
    #[must_use]
    pub fn debit_total(&self) -> u64 {
        self.batches.iter().map(Batch::debit_total).sum()
    }

    /// Sum of credit amounts in cents.
    #[must_use]
    pub fn credit_total(&self) -> u64 {
        self.batches.iter().map(Batch::credit_total).sum()
    }

    /// Decodes a NACHA document from its on-disk bytes.
    ///
    /// Lenient with respect to control records: batch controls close the
    /// current batch, file controls and `9`-filler are ignored, and addenda
    /// records are skipped.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(data)
            .map_err(|_| Error::parse("document is not valid UTF-8"))?;

        let mut header: Option<FileHeader> = None;
        let mut batches: Vec<Batch> = Vec::new();
        let mut current: Option<Batch> = None;

        for (idx, line) in text.lines().enumerate() {
            let lineno = idx + 1;
            if line.is_empty() {
                continue;
            }
            if line.len() != RECORD_LENGTH || !line.is_ascii() {
                return Err(Error::parse_at(
                    format!("expected {RECORD_LENGTH} ASCII characters, found {}", line.len()),
                    lineno,
                ));
            }

            match &line[0..1] {
                "1" => header = Some(decode_file_header(line)),
                "5" => {
                    // A new batch header implicitly closes an unterminated batch.
                    if let Some(batch) = current.take() {
                        batches.push(batch);
                    }
                    current = Some(Batch {
                        header: decode_batch_header(line, lineno)?,
                        entries: Vec::new(),
                    });
                }
                "6" => {
                    let entry = decode_entry(line, lineno)?;
                    match current.as_mut() {
                        Some(batch) => batch.entries.push(entry),
                        None => {
                            return Err(Error::parse_at("entry detail outside a batch", lineno));
                        }
                    }
                }
                "7" => {} // addenda are not modeled
                "8" => {
                    if let Some(batch) = current.take() {
                        batches.push(batch);
                    }
                }
                "9" => {} // file control or block filler
                other => {
                    return Err(Error::parse_at(format!("unknown record type {other:?}"), lineno));
                }
            }
        }

        if let Some(batch) = current.take() {
            batches.push(batch);
        }

        let Some(header) = header else {
            return Err(Error::parse("missing file header record"));
        };

        Ok(Self { header, batches })
    }

    /// Encodes the document to NACHA bytes, computing batch and file
    /// controls and padding to the blocking factor.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut lines: Vec<String> = Vec::new();
        lines.push(encode_file_header(&self.header)?);

        for batch in &self.batches {
            lines.push(encode_batch_header(&batch.header)?);
            for entry in &batch.entries {
                lines.push(encode_entry(entry)?);
            }
            lines.push(encode_batch_control(batch)?);
        }

        let entry_count = self.entry_count();
        let entry_hash: u64 = self.batches.iter().map(Batch::entry_hash).sum::<u64>() % 10_000_000_000;
        let record_count = lines.len() + 1; // plus the file control itself
        let block_count = record_count.div_ceil(BLOCKING_FACTOR);

        lines.push(encode_file_control(
            self.batches.len(),
            block_count,
            entry_count,
            entry_hash,
            self.debit_total(),
            self.credit_total(),
        )?);

        while lines.len() % BLOCKING_FACTOR != 0 {
            lines.push("9".repeat(RECORD_LENGTH));
        }

        let mut out = lines.join("\n");
        out.push('\n');
        Ok(out.into_bytes())
    }
}

fn field(line: &str, range: std::ops::Range<usize>) -> &str {
    line[range].trim()
}

fn num_field<T: std::str::FromStr + Default>(
    line: &str,
    range: std::ops::Range<usize>,
    what: &str,
    lineno: usize,
) -> Result<T> {
    let raw = field(line, range);
    if raw.is_empty() {
        return Ok(T::default());
    }
    raw.parse()
        .map_err(|_| Error::parse_at(format!("invalid {what}: {raw:?}"), lineno))
}

fn decode_file_header(line: &str) -> FileHeader {
    FileHeader {
        immediate_destination: field(line, 3..13).to_string(),
        immediate_origin: field(line, 13..23).to_string(),
        file_creation_date: field(line, 23..29).to_string(),
        file_creation_time: field(line, 29..33).to_string(),
        file_id_modifier: field(line, 33..34).to_string(),
        immediate_destination_name: field(line, 40..63).to_string(),
        immediate_origin_name: field(line, 63..86).to_string(),
    }
}

fn decode_batch_header(line: &str, lineno: usize) -> Result<BatchHeader> {
    Ok(BatchHeader {
        service_class_code: num_field(line, 1..4, "service class code", lineno)?,
        company_name: field(line, 4..20).to_string(),
        company_identification: field(line, 40..50).to_string(),
        standard_entry_class: field(line, 50..53).to_string(),
        entry_description: field(line, 53..63).to_string(),
        effective_entry_date: field(line, 69..75).to_string(),
        originator_status: field(line, 78..79).to_string(),
        odfi_identification: field(line, 79..87).to_string(),
        batch_number: num_field(line, 87..94, "batch number", lineno)?,
    })
}

fn decode_entry(line: &str, lineno: usize) -> Result<EntryDetail> {
    Ok(EntryDetail {
        transaction_code: num_field(line, 1..3, "transaction code", lineno)?,
        rdfi_identification: field(line, 3..11).to_string(),
        check_digit: field(line, 11..12).to_string(),
        dfi_account_number: field(line, 12..29).to_string(),
        amount: num_field(line, 29..39, "amount", lineno)?,
        individual_identification: field(line, 39..54).to_string(),
        individual_name: field(line, 54..76).to_string(),
        discretionary_data: field(line, 76..78).to_string(),
        addenda_record_indicator: num_field(line, 78..79, "addenda indicator", lineno)?,
        trace_number: num_field(line, 79..94, "trace number", lineno)?,
    })
}

/// Left-justified alphanumeric field, space padded, truncated to width.
fn alpha(value: &str, width: usize) -> String {
    let mut s: String = value.chars().take(width).collect();
    while s.len() < width {
        s.push(' ');
    }
    s
}

/// Right-justified numeric field, zero padded.
fn numeric(value: u64, width: usize, what: &str) -> Result<String> {
    let s = value.to_string();
    if s.len() > width {
        return Err(Error::validation(format!("{what} exceeds {width} digits: {value}")));
    }
    Ok(format!("{value:0>width$}"))
}

/// Right-justified routing field, space padded.
fn routing(value: &str, width: usize, what: &str) -> Result<String> {
    if value.len() > width {
        return Err(Error::validation(format!("{what} exceeds {width} characters: {value:?}")));
    }
    Ok(format!("{value:>width$}"))
}

fn encode_file_header(h: &FileHeader) -> Result<String> {
    let line = format!(
        "101{}{}{}{}{}094101{}{}{}",
        routing(&h.immediate_destination, 10, "immediate destination")?,
        routing(&h.immediate_origin, 10, "immediate origin")?,
        alpha(&h.file_creation_date, 6),
        alpha(&h.file_creation_time, 4),
        alpha(&h.file_id_modifier, 1),
        alpha(&h.immediate_destination_name, 23),
        alpha(&h.immediate_origin_name, 23),
        alpha("", 8),
    );
    debug_assert_eq!(line.len(), RECORD_LENGTH);
    Ok(line)
}

fn encode_batch_header(h: &BatchHeader) -> Result<String> {
    let line = format!(
        "5{}{}{}{}{}{}{}{}{}{}{}{}",
        numeric(u64::from(h.service_class_code), 3, "service class code")?,
        alpha(&h.company_name, 16),
        alpha("", 20),
        alpha(&h.company_identification, 10),
        alpha(&h.standard_entry_class, 3),
        alpha(&h.entry_description, 10),
        alpha("", 6),
        alpha(&h.effective_entry_date, 6),
        alpha("", 3),
        alpha(&h.originator_status, 1),
        alpha(&h.odfi_identification, 8),
        numeric(u64::from(h.batch_number), 7, "batch number")?,
    );
    debug_assert_eq!(line.len(), RECORD_LENGTH);
    Ok(line)
}

fn encode_entry(e: &EntryDetail) -> Result<String> {
    let line = format!(
        "6{}{}{}{}{}{}{}{}{}{}",
        numeric(u64::from(e.transaction_code), 2, "transaction code")?,
        alpha(&e.rdfi_identification, 8),
        alpha(&e.check_digit, 1),
        alpha(&e.dfi_account_number, 17),
        numeric(e.amount, 10, "amount")?,
        alpha(&e.individual_identification, 15),
        alpha(&e.individual_name, 22),
        alpha(&e.discretionary_data, 2),
        numeric(u64::from(e.addenda_record_indicator), 1, "addenda indicator")?,
        numeric(e.trace_number, 15, "trace number")?,
    );
    debug_assert_eq!(line.len(), RECORD_LENGTH);
    Ok(line)
}

fn encode_batch_control(batch: &Batch) -> Result<String> {
    let line = format!(
        "8{}{}{}{}{}{}{}{}{}{}",
        numeric(u64::from(batch.header.service_class_code), 3, "service class code")?,
        numeric(batch.entries.len() as u64, 6, "entry count")?,
        numeric(batch.entry_hash(), 10, "entry hash")?,
        numeric(batch.debit_total(), 12, "debit total")?,
        numeric(batch.credit_total(), 12, "credit total")?,
        alpha(&batch.header.company_identification, 10),
        alpha("", 19),
        alpha("", 6),
        alpha(&batch.header.odfi_identification, 8),
        numeric(u64::from(batch.header.batch_number), 7, "batch number")?,
    );
    debug_assert_eq!(line.len(), RECORD_LENGTH);
    Ok(line)
}

fn encode_file_control(
    batch_count: usize,
    block_count: usize,
    entry_count: usize,
    entry_hash: u64,
    debit_total: u64,
    credit_total: u64,
) -> Result<String> {
    let line = format!(
        "9{}{}{}{}{}{}{}",
        numeric(batch_count as u64, 6, "batch count")?,
        numeric(block_count as u64, 6, "block count")?,
        numeric(entry_count as u64, 8, "entry count")?,
        numeric(entry_hash, 10, "entry hash")?,
        numeric(debit_total, 12, "debit total")?,
        numeric(credit_total, 12, "credit total")?,
        alpha("", 39),
    );
    debug_assert_eq!(line.len(), RECORD_LENGTH);
    Ok(line)
}
