use std::io::Read;

use crate::command::TransferKind;
use csv::{DeserializeRecordsIntoIter, Trim};
use rust_decimal::Decimal;
use serde::{Deserialize, de::DeserializeOwned};

/// One row of the transfer replay file. `tx` is a caller label; the engine
/// issues the real transaction ids.
#[derive(Debug, Deserialize)]
pub struct TransferRow {
    #[serde(rename = "type")]
    pub kind: TransferKind,
    pub tx: u32,
    pub sender: Option<String>,
    pub recipient: Option<String>,
    pub amount: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
pub struct CustomerRow {
    pub customer: String,
    pub balance: Decimal,
}

/// Parses rows in CSV format, yielding each with the line it started on.
pub struct CsvRowParser<R, T> {
    iter: DeserializeRecordsIntoIter<R, T>,
}

impl<R, T> CsvRowParser<R, T>
where
    R: Read,
    T: DeserializeOwned,
{
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(Trim::All)
            .flexible(true)
            .from_reader(source);

        Self {
            iter: reader.into_deserialize(),
        }
    }
}

impl<R, T> Iterator for CsvRowParser<R, T>
where
    R: Read,
    T: DeserializeOwned,
{
    type Item = (u64, csv::Result<T>);

    fn next(&mut self) -> Option<Self::Item> {
        let curr_line = self.iter.reader().position().line();
        self.iter.next().map(|row| (curr_line, row))
    }
}
