use crate::entity::{Record, META_FIELDS};
use std::collections::BTreeSet;
use tabled::{builder::Builder, settings::Style, Table, Tabled};

#[derive(Tabled)]
struct KindCount {
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Entities")]
    entities: u64,
}

/// Entity counts per kind.
pub fn counts_table(counts: &[(String, u64)]) -> String {
    if counts.is_empty() {
        return String::new();
    }
    let rows = counts.iter().map(|(kind, entities)| KindCount {
        kind: kind.clone(),
        entities: *entities,
    });
    Table::new(rows).with(Style::rounded()).to_string()
}

/// One row per record: the uid, then every property any record has, in
/// name order. Timestamps and flags are left out.
pub fn records_table(records: &[Record]) -> String {
    if records.is_empty() {
        return String::new();
    }

    let columns: BTreeSet<&str> = records
        .iter()
        .flat_map(|r| r.properties.keys().map(String::as_str))
        .filter(|name| !META_FIELDS.contains(name))
        .collect();

    let mut builder = Builder::default();
    builder.push_record(std::iter::once("uid").chain(columns.iter().copied()));
    for record in records {
        builder.push_record(
            std::iter::once(record.uid().to_string())
                .chain(columns.iter().map(|c| record.field(c).display())),
        );
    }
    builder.build().with(Style::rounded()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uid::Uid;
    use crate::value::Properties;

    #[test]
    fn test_records_table_has_union_of_columns() {
        let mut a = Record::new(Uid::parse("Widget_a").unwrap(), Properties::new());
        a.set("name", "gear");
        let mut b = Record::new(Uid::parse("Widget_b").unwrap(), Properties::new());
        b.set("size", 3i64);

        let table = records_table(&[a, b]);
        let header = table.lines().nth(1).unwrap();
        assert!(header.contains("uid"));
        assert!(header.contains("name"));
        assert!(header.contains("size"));
        assert!(table.contains("Widget_b"));
        assert!(records_table(&[]).is_empty());
    }

    #[test]
    fn test_counts_table() {
        let table = counts_table(&[("Widget".to_string(), 7), ("Theme".to_string(), 0)]);
        assert!(table.contains("Kind"));
        assert!(table.contains("Widget"));
        assert!(table.contains('7'));
        assert!(counts_table(&[]).is_empty());
    }
}
