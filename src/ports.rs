use anyhow::{bail, Context, Result};

/// Parse a port list as accepted by scanners such as nmap's `-p`.
///
/// Supported items, separated by commas:
/// - single port number: `80`
/// - inclusive range: `8000-8010`
/// - whitespace around items is ignored, empty items are errors
///
/// Returns the deduplicated ports in order of first appearance.
pub fn parse_port_list(s: &str) -> Result<Vec<u16>> {
    let mut out: Vec<u16> = Vec::new();
    let mut seen = std::collections::HashSet::new();

    if s.trim().is_empty() {
        bail!("empty port list");
    }

    for (idx, raw_item) in s.split(',').enumerate() {
        let item_no = idx + 1;
        let item = raw_item.trim();
        if item.is_empty() {
            bail!("item {item_no}: empty entry");
        }

        // Range `start-end`
        if let Some((a, b)) = item.split_once('-') {
            let start = parse_port_str(a.trim())
                .with_context(|| format!("item {item_no}: invalid start in range: {a}"))?;
            let end = parse_port_str(b.trim())
                .with_context(|| format!("item {item_no}: invalid end in range: {b}"))?;
            if start > end {
                bail!("item {item_no}: invalid range {start}-{end} (start > end)");
            }
            for p in start..=end {
                if seen.insert(p) {
                    out.push(p);
                }
            }
            continue;
        }

        // Single number
        let p = parse_port_str(item)
            .with_context(|| format!("item {item_no}: invalid port value: {item}"))?;
        if seen.insert(p) {
            out.push(p);
        }
    }

    Ok(out)
}

fn parse_port_str(s: &str) -> Result<u16> {
    let val: u32 = s.parse::<u32>().map_err(|e| anyhow::anyhow!(e))?;
    if val == 0 || val > 65535 {
        bail!("port out of range: {val}");
    }
    Ok(val as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_single_ports() {
        let ports = parse_port_list("80, 22 ,443").unwrap();
        assert_eq!(ports, vec![80, 22, 443]);
    }

    #[test]
    fn parse_ranges_and_dedup() {
        let ports = parse_port_list("8000-8002,80,8001").unwrap();
        assert_eq!(ports, vec![8000, 8001, 8002, 80]);
    }

    #[test]
    fn out_of_range_values_error() {
        assert!(parse_port_list("999999").is_err());
        assert!(parse_port_list("0").is_err());
        assert!(parse_port_list("1-70000").is_err());
    }

    #[test]
    fn malformed_lists_error() {
        assert!(parse_port_list("").is_err());
        assert!(parse_port_list("80,,443").is_err());
        assert!(parse_port_list("443-80").is_err());
        assert!(parse_port_list("http").is_err());
    }
}
