//! Line and tag parsing for the two prescription layouts.

use chrono::{NaiveDate, NaiveDateTime};
use log::debug;
use roxmltree::{Document, Node};

use super::Item;
use crate::logutil::escape_log;

const FIELD_DELIMITER: char = '\\';
const TEXT_FIELDS: usize = 8;

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedText {
    pub patient_name: String,
    pub items: Vec<Item>,
    /// Lines with fewer than eight fields.
    pub dropped: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedXml {
    pub patient_name: String,
    pub order_date: Option<NaiveDate>,
    pub order_time: Option<NaiveDateTime>,
    pub items: Vec<Item>,
}

/// Parse the backslash-delimited text layout. `None` if the file holds no
/// non-empty line at all.
///
/// Only the field count rejects a line. Numeric columns are read up to the
/// first character that cannot continue a number (`5ml` is 5) and default to
/// zero. Repeated item codes stay separate lines.
pub fn parse_text(content: &str) -> Option<ParsedText> {
    let mut lines = content.lines().map(str::trim).filter(|l| !l.is_empty());
    let patient_name = lines.next()?.to_string();

    let mut items = Vec::new();
    let mut dropped = 0usize;
    for line in lines {
        match parse_item_line(line) {
            Some(item) => items.push(item),
            None => {
                dropped += 1;
                debug!("Dropped prescription line '{}'", escape_log(line));
            }
        }
    }
    items.sort_by_key(|i| i.line_order);
    Some(ParsedText {
        patient_name,
        items,
        dropped,
    })
}

fn parse_item_line(line: &str) -> Option<Item> {
    let fields: Vec<&str> = line.split(FIELD_DELIMITER).map(str::trim).collect();
    if fields.len() < TEXT_FIELDS {
        return None;
    }
    Some(Item {
        code: fields[0].to_string(),
        name: fields[1].to_string(),
        volume_per_dose: leading_number(fields[2]).unwrap_or(0.0),
        doses_per_day: count(fields[3]),
        period_days: count(fields[4]),
        total_quantity: count(fields[5]),
        date_tag: fields[6].to_string(),
        line_order: count(fields[7]),
    })
}

/// The number at the start of `field`, ignoring whatever follows it.
fn leading_number(field: &str) -> Option<f64> {
    let bytes = field.as_bytes();
    let mut end = 0;
    if matches!(bytes.first(), Some(b'+' | b'-')) {
        end = 1;
    }
    let digits_start = end;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    if end < bytes.len() && bytes[end] == b'.' {
        let frac = end + 1;
        let mut after = frac;
        while after < bytes.len() && bytes[after].is_ascii_digit() {
            after += 1;
        }
        if after > frac {
            end = after;
        }
    }
    if end == digits_start {
        return None;
    }
    field[..end].parse().ok()
}

/// Whole, non-negative count; fractions like `105.0` are rounded.
fn count(field: &str) -> u32 {
    match leading_number(field) {
        Some(f) if f.is_finite() && f > 0.0 => f.round().min(u32::MAX as f64) as u32,
        _ => 0,
    }
}

/// Receipt date from a record id such as `20240105_0012`.
pub fn date_from_record_id(record_id: &str) -> Option<NaiveDate> {
    let head = record_id.get(..8)?;
    if !head.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    NaiveDate::parse_from_str(head, "%Y%m%d").ok()
}

/// Parse the XML layout. `Ok(None)` when the document has no patient name;
/// `MedItem` blocks missing any field are skipped.
pub fn parse_xml(content: &str) -> Result<Option<ParsedXml>, roxmltree::Error> {
    let doc = Document::parse(content)?;
    let root = doc.root_element();
    let Some(patient_name) = child_text(root, "PtntNm") else {
        return Ok(None);
    };
    let order_date = child_text(root, "OrderDt").and_then(|t| date_from_record_id(&t));
    let order_time = child_text(root, "OrderDtm")
        .and_then(|t| t.get(..14).map(str::to_string))
        .and_then(|t| NaiveDateTime::parse_from_str(&t, "%Y%m%d%H%M%S").ok());
    let date_tag = order_date
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_default();

    let items = root
        .descendants()
        .filter(|n| n.is_element() && n.tag_name().name() == "MedItem")
        .enumerate()
        .filter_map(|(index, node)| {
            let item = xml_item(node, &date_tag, index as u32 + 1);
            if item.is_none() {
                debug!("Skipped incomplete MedItem #{}", index + 1);
            }
            item
        })
        .collect();
    Ok(Some(ParsedXml {
        patient_name,
        order_date,
        order_time,
        items,
    }))
}

fn xml_item(node: Node<'_, '_>, date_tag: &str, line_order: u32) -> Option<Item> {
    let code = child_text(node, "Code")?;
    let name = child_text(node, "MedNm")?;
    let volume = leading_number(&child_text(node, "Dose")?)?;
    let daily = count(&child_text(node, "DayTakeCnt")?);
    let period = count(&child_text(node, "TakeDays")?);
    let total = (volume * daily as f64 * period as f64).round();
    if !total.is_finite() || total < 0.0 || total > u32::MAX as f64 {
        return None;
    }
    Some(Item {
        code,
        name,
        volume_per_dose: volume,
        doses_per_day: daily,
        period_days: period,
        total_quantity: total as u32,
        date_tag: date_tag.to_string(),
        line_order,
    })
}

/// Trimmed text of the first descendant element named `tag`; `None` when
/// absent or empty. Entity references come back decoded.
fn child_text(node: Node<'_, '_>, tag: &str) -> Option<String> {
    node.descendants()
        .find(|n| n.is_element() && n.tag_name().name() == tag)
        .and_then(|n| n.text())
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_layout() {
        let content = "홍길동\r\n\
            SYR2\\Ibuprofen\\2.5\\3\\5\\38\\20240105\\2\r\n\
            SYR1\\Amoxicillin\\5\\3\\7\\105\\20240105\\1\r\n\
            short\\line\r\n\
            \r\n\
            SYR3\\x\\abc\\3\\7\\105\\20240105\\3\n";
        let parsed = parse_text(content).unwrap();
        assert_eq!(parsed.patient_name, "홍길동");
        assert_eq!(parsed.dropped, 1);
        let codes: Vec<_> = parsed.items.iter().map(|i| i.code.as_str()).collect();
        assert_eq!(codes, vec!["SYR1", "SYR2", "SYR3"]);
        let first = &parsed.items[0];
        assert_eq!(first.volume_per_dose, 5.0);
        assert_eq!(first.doses_per_day, 3);
        assert_eq!(first.period_days, 7);
        assert_eq!(first.total_quantity, 105);
        assert_eq!(first.date_tag, "20240105");
        assert_eq!(parsed.items[1].volume_per_dose, 2.5);
        // Unreadable volume is zero, the line itself is kept.
        assert_eq!(parsed.items[2].volume_per_dose, 0.0);
        assert_eq!(parsed.items[2].total_quantity, 105);
    }

    #[test]
    fn extra_fields_are_tolerated() {
        let parsed = parse_text("P\nA\\n\\1\\1\\1\\1\\d\\1\\extra").unwrap();
        assert_eq!(parsed.items.len(), 1);
    }

    #[test]
    fn numbers_with_units_keep_the_line() {
        let content = "Kim\n\
            SYR1\\a\\5\\3\\1\\15\\d\\1\n\
            SYR1\\a\\5\\3\\1\\15\\d\\2\n\
            SYR2\\b\\5ml\\2회\\3일\\30.0\\d\\3\n";
        let parsed = parse_text(content).unwrap();
        assert_eq!(parsed.dropped, 0);
        let summary: Vec<_> = parsed
            .items
            .iter()
            .map(|i| (i.code.as_str(), i.total_quantity))
            .collect();
        assert_eq!(summary, vec![("SYR1", 15), ("SYR1", 15), ("SYR2", 30)]);
        let syr2 = &parsed.items[2];
        assert_eq!(syr2.volume_per_dose, 5.0);
        assert_eq!((syr2.doses_per_day, syr2.period_days), (2, 3));
    }

    #[test]
    fn leading_number_reads_prefix() {
        assert_eq!(leading_number("2.5"), Some(2.5));
        assert_eq!(leading_number("5ml"), Some(5.0));
        assert_eq!(leading_number("7."), Some(7.0));
        assert_eq!(leading_number("-3x"), Some(-3.0));
        assert_eq!(leading_number("ml5"), None);
        assert_eq!(leading_number(""), None);
        assert_eq!(count("-3"), 0);
        assert_eq!(count("104.6"), 105);
    }

    #[test]
    fn repeated_codes_sort_by_line_order() {
        let parsed = parse_text("P\nA\\second\\1\\1\\1\\9\\d\\2\nA\\first\\1\\1\\1\\4\\d\\1").unwrap();
        let names: Vec<_> = parsed.items.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["first", "second"]);
    }

    #[test]
    fn blank_file_has_no_patient() {
        assert!(parse_text("\n \r\n").is_none());
        let only_patient = parse_text("  Kim  \n").unwrap();
        assert_eq!(only_patient.patient_name, "Kim");
        assert!(only_patient.items.is_empty());
    }

    #[test]
    fn record_id_dates() {
        assert_eq!(
            date_from_record_id("20240105_0012"),
            NaiveDate::from_ymd_opt(2024, 1, 5)
        );
        assert_eq!(date_from_record_id("20241305"), None);
        assert_eq!(date_from_record_id("2024"), None);
        assert_eq!(date_from_record_id("abcd0105x"), None);
    }

    #[test]
    fn xml_layout() {
        let xml = r#"<?xml version="1.0" encoding="utf-8"?>
<Order>
  <OrderNum>A77</OrderNum>
  <OrderDt>20240105</OrderDt>
  <OrderDtm>20240105093012</OrderDtm>
  <PtntNm>김철수</PtntNm>
  <MedItem><Code>SYR1</Code><MedNm>시럽</MedNm><Dose>2.5</Dose><DayTakeCnt>3</DayTakeCnt><TakeDays>5</TakeDays></MedItem>
  <MedItem><Code>SYR2</Code><MedNm>물약</MedNm><Dose>1</Dose></MedItem>
  <MedItem><Code>SYR3</Code><MedNm>현탁액</MedNm><Dose>4</Dose><DayTakeCnt>2</DayTakeCnt><TakeDays>3</TakeDays></MedItem>
</Order>"#;
        let parsed = parse_xml(xml).unwrap().unwrap();
        assert_eq!(parsed.patient_name, "김철수");
        assert_eq!(parsed.order_date, NaiveDate::from_ymd_opt(2024, 1, 5));
        assert_eq!(
            parsed.order_time,
            NaiveDate::from_ymd_opt(2024, 1, 5)
                .unwrap()
                .and_hms_opt(9, 30, 12)
        );
        assert_eq!(parsed.items.len(), 2);
        // 2.5 * 3 * 5 = 37.5 rounds to 38
        assert_eq!(parsed.items[0].total_quantity, 38);
        assert_eq!(parsed.items[0].line_order, 1);
        assert_eq!(parsed.items[1].code, "SYR3");
        assert_eq!(parsed.items[1].line_order, 3);
        assert_eq!(parsed.items[1].date_tag, "2024-01-05");
    }

    #[test]
    fn xml_without_patient_is_rejected() {
        assert!(parse_xml("<Order><OrderDt>20240105</OrderDt></Order>")
            .unwrap()
            .is_none());
    }

    #[test]
    fn xml_entities_and_attributes() {
        let xml = r#"<Order>
  <PtntNm>Kim &amp; Lee</PtntNm>
  <MedItem seq="1"><Code>SYR1</Code><MedNm>A &lt;B&gt;</MedNm><Dose>2</Dose><DayTakeCnt>3</DayTakeCnt><TakeDays>2</TakeDays></MedItem>
</Order>"#;
        let parsed = parse_xml(xml).unwrap().unwrap();
        assert_eq!(parsed.patient_name, "Kim & Lee");
        assert_eq!(parsed.items.len(), 1);
        assert_eq!(parsed.items[0].name, "A <B>");
        assert_eq!(parsed.items[0].total_quantity, 12);
        assert_eq!(parsed.order_date, None);
    }

    #[test]
    fn truncated_xml_is_an_error() {
        assert!(parse_xml("<Order><PtntNm>Kim</PtntNm><MedItem>").is_err());
    }
}
