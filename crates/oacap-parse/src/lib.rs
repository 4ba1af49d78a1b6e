//! Tolerant CSV row parser for operationally-available capacity reports.
//!
//! A report row that cannot be turned into a [`RecordDraft`] is logged and
//! dropped on its own; it never aborts the rest of the payload.

use csv::{ReaderBuilder, StringRecord};
use oacap_core::RecordDraft;
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "oacap-parse";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Column {
    Loc,
    LocZone,
    LocName,
    LocPurpose,
    MeasureBasis,
    OperCapacity,
    DesignCapacity,
    ScheduledQty,
    OperationallyAvailable,
    TotalScheduled,
}

const COLUMN_COUNT: usize = 10;

/// Source header label -> canonical column.
const HEADER_MAP: [(&str, Column); COLUMN_COUNT] = [
    ("Loc", Column::Loc),
    ("Loc Zone", Column::LocZone),
    ("Loc Name", Column::LocName),
    ("Loc Purpose", Column::LocPurpose),
    ("Meas Basis Desc", Column::MeasureBasis),
    ("Oper Capacity", Column::OperCapacity),
    ("Design Capacity", Column::DesignCapacity),
    ("Scheduled Qty", Column::ScheduledQty),
    ("Operationally Available", Column::OperationallyAvailable),
    ("Total Scheduled", Column::TotalScheduled),
];

impl Column {
    fn label(self) -> &'static str {
        HEADER_MAP[self as usize].0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("missing required field: Loc")]
    MissingLocation,
    #[error("malformed row: {0}")]
    Malformed(String),
}

/// A dropped row with enough context to find it in the source payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowRejection {
    /// 1-based data row index (the header is not counted).
    pub row: usize,
    pub line: Option<u64>,
    pub reason: RejectReason,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParseReport {
    pub drafts: Vec<RecordDraft>,
    pub rejected: Vec<RowRejection>,
    pub rows_read: usize,
    pub numeric_warnings: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("could not parse numeric value {raw:?}")]
pub struct NumericError {
    pub raw: String,
}

/// Strip thousands separators and surrounding whitespace, then parse exactly.
/// Empty input is a null quantity, not an error.
pub fn parse_numeric(raw: &str) -> Result<Option<Decimal>, NumericError> {
    let cleaned = raw.replace(',', "");
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        return Ok(None);
    }
    Decimal::from_str_exact(cleaned)
        .map(Some)
        .map_err(|_| NumericError {
            raw: raw.to_string(),
        })
}

/// Column positions resolved from one payload's header row.
#[derive(Debug, Clone, Copy)]
struct HeaderIndex([Option<usize>; COLUMN_COUNT]);

impl HeaderIndex {
    fn from_headers(headers: &StringRecord) -> Self {
        let mut index = [None; COLUMN_COUNT];
        for (position, header) in headers.iter().enumerate() {
            let label = header.trim_start_matches('\u{feff}').trim();
            if let Some((_, column)) = HEADER_MAP
                .iter()
                .find(|(known, _)| known.eq_ignore_ascii_case(label))
            {
                index[*column as usize].get_or_insert(position);
            }
        }
        Self(index)
    }

    fn has(&self, column: Column) -> bool {
        self.0[column as usize].is_some()
    }

    fn cell<'r>(&self, record: &'r StringRecord, column: Column) -> &'r str {
        self.0[column as usize]
            .and_then(|i| record.get(i))
            .unwrap_or("")
    }
}

#[derive(Debug, Clone, Default)]
pub struct RowParser;

impl RowParser {
    pub fn new() -> Self {
        Self
    }

    pub fn parse(&self, content: &str) -> Vec<RecordDraft> {
        self.parse_report(content).drafts
    }

    pub fn parse_report(&self, content: &str) -> ParseReport {
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(content.as_bytes());

        let mut report = ParseReport::default();
        let index = match reader.headers() {
            Ok(headers) => HeaderIndex::from_headers(headers),
            Err(err) => {
                warn!(error = %err, "unreadable report header, no rows parsed");
                return report;
            }
        };
        if !index.has(Column::Loc) {
            warn!("report header has no Loc column; every row will be rejected");
        }

        for (i, result) in reader.records().enumerate() {
            let row = i + 1;
            report.rows_read += 1;
            let cleaned = match result {
                Ok(record) => {
                    let line = record.position().map(|p| p.line());
                    clean_row(&index, &record, row, &mut report.numeric_warnings)
                        .map_err(|reason| RowRejection { row, line, reason })
                }
                Err(err) => Err(RowRejection {
                    row,
                    line: err.position().map(|p| p.line()),
                    reason: RejectReason::Malformed(err.to_string()),
                }),
            };
            match cleaned {
                Ok(draft) => report.drafts.push(draft),
                Err(rejection) => {
                    warn!(
                        row = rejection.row,
                        line = rejection.line,
                        reason = %rejection.reason,
                        "skipping report row"
                    );
                    report.rejected.push(rejection);
                }
            }
        }

        info!(
            rows = report.rows_read,
            parsed = report.drafts.len(),
            rejected = report.rejected.len(),
            "parsed report"
        );
        report
    }
}

fn clean_row(
    index: &HeaderIndex,
    record: &StringRecord,
    row: usize,
    numeric_warnings: &mut usize,
) -> Result<RecordDraft, RejectReason> {
    let loc = index.cell(record, Column::Loc).trim();
    if loc.is_empty() {
        return Err(RejectReason::MissingLocation);
    }

    let text = |column| {
        let value = index.cell(record, column).trim();
        (!value.is_empty()).then(|| value.to_string())
    };
    let mut quantity = |column: Column| match parse_numeric(index.cell(record, column)) {
        Ok(value) => value,
        Err(err) => {
            *numeric_warnings += 1;
            warn!(row, loc, column = column.label(), error = %err, "numeric field set to null");
            None
        }
    };

    Ok(RecordDraft {
        loc: loc.to_string(),
        loc_zone: text(Column::LocZone),
        loc_name: text(Column::LocName),
        loc_purpose: text(Column::LocPurpose),
        measure_basis: text(Column::MeasureBasis),
        oper_capacity: quantity(Column::OperCapacity),
        design_capacity: quantity(Column::DesignCapacity),
        scheduled_qty: quantity(Column::ScheduledQty),
        operationally_available: quantity(Column::OperationallyAvailable),
        total_scheduled: quantity(Column::TotalScheduled),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "Loc,Loc Zone,Loc Name,Loc Purpose,Meas Basis Desc,Oper Capacity,Design Capacity,Scheduled Qty,Operationally Available,Total Scheduled,IT";

    fn payload(rows: &[&str]) -> String {
        let mut out = String::from(HEADER);
        for row in rows {
            out.push('\n');
            out.push_str(row);
        }
        out.push('\n');
        out
    }

    fn dec(s: &str) -> Decimal {
        Decimal::from_str_exact(s).unwrap()
    }

    #[test]
    fn numeric_fields_tolerate_separators_and_garbage() {
        assert_eq!(parse_numeric("1,234.50"), Ok(Some(dec("1234.5"))));
        assert_eq!(parse_numeric("  42 "), Ok(Some(Decimal::from(42))));
        assert_eq!(parse_numeric("-1,000"), Ok(Some(Decimal::from(-1000))));
        assert_eq!(parse_numeric(""), Ok(None));
        assert_eq!(parse_numeric("   "), Ok(None));
        assert!(parse_numeric("abc").is_err());
        assert!(parse_numeric("NaN").is_err());
    }

    #[test]
    fn numeric_fields_keep_every_digit() {
        let big = parse_numeric("12,345,678,901,234,567.89").unwrap().unwrap();
        assert_eq!(big.to_string(), "12345678901234567.89");

        let sum = parse_numeric("0.1").unwrap().unwrap() + parse_numeric("0.2").unwrap().unwrap();
        assert_eq!(sum, dec("0.3"));
        assert_eq!(parse_numeric("1,234.50").unwrap().unwrap().to_string(), "1234.50");
    }

    #[test]
    fn row_missing_location_is_dropped_not_raised() {
        let csv = payload(&[
            "500001,West,Blanco Hub,M,Dth,\"1,000\",\"1,200\",800,200,800,N",
            "500002,West,Gallup,D,Dth,500,600,100,400,100,N",
            ",East,Orphan Row,R,Dth,1,1,1,1,1,N",
            "500003,East,Thoreau,R,Dth,10,10,5,5,5,Y",
        ]);
        let report = RowParser::new().parse_report(&csv);

        assert_eq!(report.rows_read, 4);
        assert_eq!(report.drafts.len(), 3);
        assert_eq!(
            report.rejected,
            vec![RowRejection {
                row: 3,
                line: Some(4),
                reason: RejectReason::MissingLocation,
            }]
        );
        let locs: Vec<_> = report.drafts.iter().map(|d| d.loc.as_str()).collect();
        assert_eq!(locs, vec!["500001", "500002", "500003"]);
    }

    #[test]
    fn columns_map_to_canonical_fields() {
        let csv = payload(&["  500001 ,West, Blanco Hub ,M,Dth,\"1,234.50\",\"2,000\",,abc,800,N"]);
        let report = RowParser::new().parse_report(&csv);
        let draft = &report.drafts[0];

        assert_eq!(draft.loc, "500001");
        assert_eq!(draft.loc_zone.as_deref(), Some("West"));
        assert_eq!(draft.loc_name.as_deref(), Some("Blanco Hub"));
        assert_eq!(draft.loc_purpose.as_deref(), Some("M"));
        assert_eq!(draft.measure_basis.as_deref(), Some("Dth"));
        assert_eq!(draft.oper_capacity, Some(dec("1234.5")));
        assert_eq!(draft.design_capacity, Some(Decimal::from(2000)));
        assert_eq!(draft.scheduled_qty, None);
        assert_eq!(draft.operationally_available, None);
        assert_eq!(draft.total_scheduled, Some(Decimal::from(800)));
        assert_eq!(report.numeric_warnings, 1);
    }

    #[test]
    fn header_order_and_extra_columns_do_not_matter() {
        let csv = "\u{feff}Total Scheduled,Flow Ind,Loc\n15,D,700100\n";
        let drafts = RowParser::new().parse(csv);

        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].loc, "700100");
        assert_eq!(drafts[0].total_scheduled, Some(Decimal::from(15)));
        assert_eq!(drafts[0].loc_name, None);
    }

    #[test]
    fn short_rows_read_missing_cells_as_empty() {
        let csv = payload(&["500001,West", "500002"]);
        let drafts = RowParser::new().parse(&csv);

        assert_eq!(drafts.len(), 2);
        assert_eq!(drafts[0].loc_zone.as_deref(), Some("West"));
        assert_eq!(drafts[1].oper_capacity, None);
    }

    #[test]
    fn duplicate_locations_are_kept_in_source_order() {
        let csv = payload(&[
            "500001,West,First,M,Dth,1,1,1,1,1,N",
            "500001,West,Second,M,Dth,2,2,2,2,2,N",
        ]);
        let drafts = RowParser::new().parse(&csv);

        assert_eq!(drafts.len(), 2);
        assert_eq!(drafts[0].loc_name.as_deref(), Some("First"));
        assert_eq!(drafts[1].loc_name.as_deref(), Some("Second"));
    }

    #[test]
    fn missing_loc_column_rejects_every_row() {
        let report = RowParser::new().parse_report("Loc Name,Oper Capacity\nBlanco,5\nGallup,6\n");

        assert!(report.drafts.is_empty());
        assert_eq!(report.rejected.len(), 2);
    }

    #[test]
    fn empty_payload_yields_nothing() {
        let report = RowParser::new().parse_report("");
        assert_eq!(report.rows_read, 0);
        assert!(report.drafts.is_empty());
        assert!(report.rejected.is_empty());
    }
}
