//! Built-in named row handlers, selected from YAML config by name (see
//! [`crate::config::DimensionSpec::rowhandlers`]). Ported from the
//! `UDF_*` functions in `examples/original_source/conf/config.py`.
//!
//! Config is data, not Rust source, so handlers come from this fixed
//! registry rather than arbitrary user closures.

use chrono::Datelike;

use crate::error::{EtlError, Result};
use crate::row::{NameMapping, Row, Value};

pub type RowHandler = fn(&mut Row, &NameMapping) -> Result<()>;

/// Splits a URL's host into `domain` and `topleveldomain`, mirroring
/// `UDF_extractdomaininfo`: the penultimate `/`-separated segment of the
/// URL is the host, and its last `.`-separated segment is the TLD.
pub fn extract_domain_info(row: &mut Row, mapping: &NameMapping) -> Result<()> {
    let url = row
        .get_mapped("url", mapping)
        .and_then(Value::as_str)
        .ok_or_else(|| EtlError::Configuration("extract_domain_info: row has no url".into()))?
        .to_string();
    let domain = url.split('/').rev().nth(1).unwrap_or(&url).to_string();
    let tld = domain.rsplit('.').next().unwrap_or(&domain).to_string();
    row.set("domain", domain);
    row.set("topleveldomain", tld);
    Ok(())
}

/// Splits a `"ServerName/Version"` string into `server`, mirroring
/// `UDF_extractserverinfo`.
pub fn extract_server_info(row: &mut Row, mapping: &NameMapping) -> Result<()> {
    let serverversion = row
        .get_mapped("serverversion", mapping)
        .and_then(Value::as_str)
        .ok_or_else(|| EtlError::Configuration("extract_server_info: row has no serverversion".into()))?
        .to_string();
    let server = serverversion.split('/').next().unwrap_or(&serverversion).to_string();
    row.set("server", server);
    Ok(())
}

/// Decomposes a `date` attribute into `day`/`month`/`year`/`week`/
/// `weekyear`, mirroring `UDF_datehandling`.
pub fn split_date_parts(row: &mut Row, mapping: &NameMapping) -> Result<()> {
    let date = row
        .get_mapped("date", mapping)
        .and_then(Value::as_date)
        .ok_or_else(|| EtlError::Configuration("split_date_parts: row has no parseable date".into()))?;
    let iso = date.iso_week();
    row.set("day", date.day() as i64);
    row.set("month", date.month() as i64);
    row.set("year", date.year() as i64);
    row.set("week", iso.week() as i64);
    row.set("weekyear", iso.year() as i64);
    Ok(())
}

/// Coerces an `errors` attribute to an integer, mirroring
/// `UDF_convertstrtoint`, defaulting to 0 on a malformed value.
pub fn parse_int_errors(row: &mut Row, mapping: &NameMapping) -> Result<()> {
    let name = mapping.resolve("errors").to_string();
    let value = row.get(&name).map(|v| v.as_int_or(0)).unwrap_or(0);
    row.set(name, value);
    Ok(())
}

/// Looks a named handler up in the built-in registry.
pub fn lookup(name: &str) -> Result<RowHandler> {
    match name {
        "extract_domain_info" => Ok(extract_domain_info),
        "extract_server_info" => Ok(extract_server_info),
        "split_date_parts" => Ok(split_date_parts),
        "parse_int_errors" => Ok(parse_int_errors),
        other => Err(EtlError::Configuration(format!("unknown row handler: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_domain_and_tld() {
        let mut row = Row::new();
        row.set("url", "http://www.example.org/page.html");
        extract_domain_info(&mut row, &NameMapping::new()).unwrap();
        assert_eq!(row.get("domain").unwrap().as_str(), Some("www.example.org"));
        assert_eq!(row.get("topleveldomain").unwrap().as_str(), Some("org"));
    }

    #[test]
    fn extracts_server_name() {
        let mut row = Row::new();
        row.set("serverversion", "nginx/1.18.0");
        extract_server_info(&mut row, &NameMapping::new()).unwrap();
        assert_eq!(row.get("server").unwrap().as_str(), Some("nginx"));
    }
}
