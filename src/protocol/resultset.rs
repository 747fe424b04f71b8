//! Text-protocol result set decoding
//!
//! A COM_QUERY response is either an OK/ERR packet or a result set:
//! column count, one definition per column, EOF, rows, EOF.

/// Read a length-encoded integer, returning the value and bytes consumed
pub fn read_lenenc_int(data: &[u8]) -> Option<(u64, usize)> {
    let first = *data.first()?;
    match first {
        0..=0xFA => Some((first as u64, 1)),
        0xFC if data.len() >= 3 => Some((u16::from_le_bytes([data[1], data[2]]) as u64, 3)),
        0xFD if data.len() >= 4 => Some((
            u32::from_le_bytes([data[1], data[2], data[3], 0]) as u64,
            4,
        )),
        0xFE if data.len() >= 9 => Some((
            u64::from_le_bytes([
                data[1], data[2], data[3], data[4], data[5], data[6], data[7], data[8],
            ]),
            9,
        )),
        _ => None,
    }
}

/// Read a length-encoded string; `None` value means SQL NULL (0xFB)
pub fn read_lenenc_str(data: &[u8]) -> Option<(Option<String>, usize)> {
    if data.first() == Some(&0xFB) {
        return Some((None, 1));
    }
    let (len, header) = read_lenenc_int(data)?;
    let len = usize::try_from(len).ok()?;
    let end = header.checked_add(len)?;
    if data.len() < end {
        return None;
    }
    let value = String::from_utf8_lossy(&data[header..end]).to_string();
    Some((Some(value), end))
}

/// Extract the column name from a protocol-41 column definition
///
/// Layout: catalog, schema, table, org_table, name, org_name, ...
pub fn parse_column_name(payload: &[u8]) -> Option<String> {
    let mut offset = 0;
    for _ in 0..4 {
        let (_, used) = read_lenenc_str(&payload[offset..])?;
        offset += used;
    }
    let (name, _) = read_lenenc_str(&payload[offset..])?;
    name
}

/// Decode a text row with `columns` values
pub fn parse_text_row(payload: &[u8], columns: usize) -> Option<Vec<Option<String>>> {
    let mut values = Vec::with_capacity(columns);
    let mut offset = 0;
    for _ in 0..columns {
        let (value, used) = read_lenenc_str(&payload[offset..])?;
        offset += used;
        values.push(value);
    }
    Some(values)
}
