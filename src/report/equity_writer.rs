use std::{fs::File, path::Path};

use polars::prelude::{CsvWriter, ParquetCompression, ParquetWriter, SerWriter};

use crate::{
    engine::equity::EquityCurve,
    error::{DataError, IoError, TickforgeResult},
};

/// Write the equity curve as CSV (`time, balance, equity, open_positions,
/// floating_pnl`).
pub fn write_equity_csv(curve: &EquityCurve, path: impl AsRef<Path>) -> TickforgeResult<()> {
    let mut frame = curve.as_frame()?;
    let mut file =
        File::create(path.as_ref()).map_err(|e| IoError::WriterCreation(e.to_string()))?;
    CsvWriter::new(&mut file)
        .finish(&mut frame)
        .map_err(|e| DataError::DataFrame(e.to_string()))?;
    Ok(())
}

/// Write the equity curve as snappy-compressed parquet.
pub fn write_equity_parquet(curve: &EquityCurve, path: impl AsRef<Path>) -> TickforgeResult<()> {
    let mut frame = curve.as_frame()?;
    let file = File::create(path.as_ref()).map_err(|e| IoError::WriterCreation(e.to_string()))?;
    ParquetWriter::new(file)
        .with_compression(ParquetCompression::Snappy)
        .finish(&mut frame)
        .map_err(|e| DataError::DataFrame(e.to_string()))?;
    Ok(())
}
