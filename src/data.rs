// Household records: loading, validation and column extraction.

use ndarray::Array2;
use polars::prelude::{
    ChunkCompare, CsvReader, DataFrame, DataType, Float64Type, NamedFrom, SerReader, Series,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::error::{Error, Result};

pub const ID: &str = "id";
pub const MALARIA_RISK: &str = "malaria_risk";
pub const NET: &str = "net";
pub const NET_NUM: &str = "net_num";
pub const ELIGIBLE: &str = "eligible";
pub const INCOME: &str = "income";
pub const TEMPERATURE: &str = "temperature";
pub const HEALTH: &str = "health";
pub const HOUSEHOLD: &str = "household";
pub const RESISTANCE: &str = "resistance";

pub const COLUMNS: [&str; 10] = [
    ID,
    MALARIA_RISK,
    NET,
    NET_NUM,
    ELIGIBLE,
    INCOME,
    TEMPERATURE,
    HEALTH,
    HOUSEHOLD,
    RESISTANCE,
];

// One surveyed household.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Household {
    pub id: i64,
    pub malaria_risk: f64,
    pub net: bool,
    pub eligible: bool,
    pub income: f64,
    pub temperature: f64,
    pub health: f64,
    pub household_size: i64,
    pub resistance: f64,
}

impl Household {
    pub fn net_num(&self) -> i64 {
        self.net as i64
    }
}

// Read a household CSV (with header) and validate every row.
pub fn load_households<P: AsRef<Path>>(path: P) -> Result<DataFrame> {
    let data = CsvReader::from_path(path.as_ref())?
        .has_header(true)
        .finish()?;
    validate_households(&data)?;
    info!(rows = data.height(), path = %path.as_ref().display(), "loaded households");
    Ok(data)
}

// Build a frame with the canonical household columns.
pub fn households_to_frame(rows: &[Household]) -> Result<DataFrame> {
    let data = DataFrame::new(vec![
        Series::new(ID, rows.iter().map(|h| h.id).collect::<Vec<i64>>()),
        Series::new(MALARIA_RISK, rows.iter().map(|h| h.malaria_risk).collect::<Vec<f64>>()),
        Series::new(NET, rows.iter().map(|h| h.net).collect::<Vec<bool>>()),
        Series::new(NET_NUM, rows.iter().map(|h| h.net_num()).collect::<Vec<i64>>()),
        Series::new(ELIGIBLE, rows.iter().map(|h| h.eligible).collect::<Vec<bool>>()),
        Series::new(INCOME, rows.iter().map(|h| h.income).collect::<Vec<f64>>()),
        Series::new(TEMPERATURE, rows.iter().map(|h| h.temperature).collect::<Vec<f64>>()),
        Series::new(HEALTH, rows.iter().map(|h| h.health).collect::<Vec<f64>>()),
        Series::new(HOUSEHOLD, rows.iter().map(|h| h.household_size).collect::<Vec<i64>>()),
        Series::new(RESISTANCE, rows.iter().map(|h| h.resistance).collect::<Vec<f64>>()),
    ])?;
    Ok(data)
}

// Check every household row against the survey schema.
//
// Aborts on the first bad row, naming its index and id. Nothing is
// repaired or dropped.
pub fn validate_households(data: &DataFrame) -> Result<()> {
    let names = data.get_column_names();
    for column in COLUMNS {
        if !names.contains(&column) {
            return Err(Error::Data {
                row: 0,
                id: "-".to_string(),
                reason: format!("missing column `{column}`"),
            });
        }
    }
    let ids = row_labels(data)?;

    for column in [MALARIA_RISK, HEALTH, RESISTANCE] {
        let values = column_f64(data, column)?;
        for (row, v) in values.iter().enumerate() {
            if !(0.0..=100.0).contains(v) {
                return Err(bad_row(&ids, row, format!("{column} = {v} is outside [0, 100]")));
            }
        }
    }
    for column in [INCOME, TEMPERATURE] {
        let values = column_f64(data, column)?;
        if let Some(row) = values.iter().position(|v| !v.is_finite()) {
            return Err(bad_row(&ids, row, format!("{column} is not a finite number")));
        }
    }
    for (row, size) in column_f64(data, HOUSEHOLD)?.iter().enumerate() {
        if *size < 1.0 || size.fract() != 0.0 {
            return Err(bad_row(&ids, row, format!("household size {size} is not a positive integer")));
        }
    }

    let net = boolean_column(data, NET)?;
    boolean_column(data, ELIGIBLE)?;
    let net_num = column_f64(data, NET_NUM)?;
    for (row, (flag, num)) in net.iter().zip(net_num.iter()).enumerate() {
        let expected = if *flag { 1.0 } else { 0.0 };
        if *num != expected {
            return Err(bad_row(&ids, row, format!("net = {flag} but net_num = {num}")));
        }
    }
    Ok(())
}

fn bad_row(ids: &[String], row: usize, reason: String) -> Error {
    Error::Data {
        row,
        id: ids.get(row).cloned().unwrap_or_else(|| row.to_string()),
        reason,
    }
}

// Household id of every row as text, or the row index when the frame has
// no id column.
pub fn row_labels(data: &DataFrame) -> Result<Vec<String>> {
    if !data.get_column_names().contains(&ID) {
        return Ok((0..data.height()).map(|i| i.to_string()).collect());
    }
    let ids = data.column(ID)?.cast(&DataType::Utf8)?;
    let labels = ids
        .utf8()?
        .into_iter()
        .enumerate()
        .map(|(row, v)| v.map(str::to_string).unwrap_or_else(|| row.to_string()))
        .collect();
    Ok(labels)
}

// Extract a numeric column as `f64`, casting integers and booleans.
// Missing values are a data error.
pub fn column_f64(data: &DataFrame, name: &str) -> Result<Vec<f64>> {
    let column = data.column(name)?.cast(&DataType::Float64)?;
    let values = column.f64()?;
    let mut out = Vec::with_capacity(values.len());
    for (row, v) in values.into_iter().enumerate() {
        match v {
            Some(v) => out.push(v),
            None => {
                let ids = row_labels(data)?;
                return Err(bad_row(&ids, row, format!("`{name}` is missing or not numeric")));
            }
        }
    }
    Ok(out)
}

// A boolean column stored either as booleans, 0/1 numbers, or
// `true`/`false` text in any case.
fn boolean_column(data: &DataFrame, name: &str) -> Result<Vec<bool>> {
    let column = data.column(name)?;
    if column.dtype() == &DataType::Utf8 {
        let ids = row_labels(data)?;
        return column
            .utf8()?
            .into_iter()
            .enumerate()
            .map(|(row, v)| match v.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
                Some("true") => Ok(true),
                Some("false") => Ok(false),
                other => Err(bad_row(&ids, row, format!("`{name}` = {other:?} is not a boolean"))),
            })
            .collect();
    }
    let ids = row_labels(data)?;
    column_f64(data, name)?
        .into_iter()
        .enumerate()
        .map(|(row, v)| match v {
            v if v == 1.0 => Ok(true),
            v if v == 0.0 => Ok(false),
            v => Err(bad_row(&ids, row, format!("`{name}` = {v} is not 0 or 1"))),
        })
        .collect()
}

// Treatment column as booleans; anything other than 0/1 is rejected.
pub fn treatment_indicator(data: &DataFrame, treatment: &str) -> Result<Vec<bool>> {
    boolean_column(data, treatment)
}

// Split a frame into its treated and control rows.
pub fn treat_control_split(data: &DataFrame, treatment: &str) -> Result<(DataFrame, DataFrame)> {
    treatment_indicator(data, treatment)?;
    let flags = data.column(treatment)?.cast(&DataType::Float64)?;
    let treat = data.filter(&flags.equal(1.0)?)?;
    let control = data.filter(&flags.equal(0.0)?)?;
    Ok((treat, control))
}

// Confounder columns as an `n x p` matrix in the order given.
pub fn covariate_matrix<S: AsRef<str>>(data: &DataFrame, columns: &[S]) -> Result<Array2<f64>> {
    let names: Vec<&str> = columns.iter().map(|c| c.as_ref()).collect();
    let x = data.select(&names)?.to_ndarray::<Float64Type>()?;
    if let Some(((row, col), _)) = x.indexed_iter().find(|(_, v)| !v.is_finite()) {
        let ids = row_labels(data)?;
        return Err(bad_row(&ids, row, format!("`{}` is missing or not finite", names[col])));
    }
    Ok(x)
}
