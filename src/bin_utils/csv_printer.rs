use std::io::Write;

use csv::Writer;
use rust_decimal::Decimal;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct CustomerBalance {
    pub customer: String,
    pub balance: Decimal,
    pub active: bool,
}

pub fn print_customers<W>(
    output: &mut W,
    customers: impl Iterator<Item = CustomerBalance>,
) -> anyhow::Result<()>
where
    W: Write,
{
    let mut writer = Writer::from_writer(output);
    for customer in customers {
        if let Err(err) = writer.serialize(customer) {
            anyhow::bail!("Failed to write to CSV: {err}")
        }
    }
    if let Err(err) = writer.flush() {
        anyhow::bail!("Failed to flush CSV writer: {err}")
    }
    Ok(())
}
