use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::error::{Error, Result};
use crate::regionprops::RegionProps;

/// Header convention of the per-cell CSV.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// `CellID, <first>, Y_centroid, X_centroid, Area, Eccentricity, <rest...>`
    Markers,
    /// `ID, X Position, Y Position, Area, Eccentricity, <all channels...>`,
    /// where "X Position" holds the centroid row.
    Stack,
}

/// One row per cell, keyed by mask label; intensity columns are joined on
/// the label.
#[derive(Debug, Clone)]
pub struct CellTable {
    cells: Vec<RegionProps>,
    row_of: HashMap<u32, usize>,
    columns: Vec<(String, Vec<Option<f64>>)>,
}

impl CellTable {
    /// Rows come from `cells`; `first` is the intensity column measured
    /// alongside them, in the same order.
    pub fn new(cells: Vec<RegionProps>, first_name: &str, first: Vec<f64>) -> Result<Self> {
        if first.len() != cells.len() {
            return Err(Error::InvalidInput(format!(
                "column {:?} has {} values for {} cells",
                first_name,
                first.len(),
                cells.len()
            )));
        }
        let row_of = cells.iter().enumerate().map(|(i, c)| (c.label, i)).collect();
        Ok(CellTable {
            cells,
            row_of,
            columns: vec![(first_name.to_string(), first.into_iter().map(Some).collect())],
        })
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(n, _)| n.as_str())
    }

    /// Left join on label: cells missing from `values` stay empty, labels
    /// not in the table are dropped.
    pub fn left_join(&mut self, name: &str, values: impl IntoIterator<Item = (u32, f64)>) {
        let mut column = vec![None; self.cells.len()];
        for (label, v) in values {
            if let Some(&row) = self.row_of.get(&label) {
                column[row] = Some(v);
            }
        }
        self.columns.push((name.to_string(), column));
    }

    #[cfg(test)]
    pub fn value(&self, label: u32, column: &str) -> Option<f64> {
        let row = *self.row_of.get(&label)?;
        self.columns
            .iter()
            .find(|(n, _)| n == column)
            .and_then(|(_, v)| v[row])
    }

    pub fn write_csv(&self, path: &Path, layout: Layout) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut wtr = csv::Writer::from_path(path)?;
        self.write_to(&mut wtr, layout)?;
        wtr.flush()?;
        Ok(())
    }

    fn write_to<W: std::io::Write>(&self, wtr: &mut csv::Writer<W>, layout: Layout) -> Result<()> {
        let morph = match layout {
            Layout::Markers => ["Y_centroid", "X_centroid", "Area", "Eccentricity"],
            Layout::Stack => ["X Position", "Y Position", "Area", "Eccentricity"],
        };
        let id = match layout {
            Layout::Markers => "CellID",
            Layout::Stack => "ID",
        };

        let mut header: Vec<&str> = vec![id];
        match layout {
            Layout::Markers => {
                let mut names = self.column_names();
                header.extend(names.next());
                header.extend(morph);
                header.extend(names);
            }
            Layout::Stack => {
                header.extend(morph);
                header.extend(self.column_names());
            }
        }
        wtr.write_record(&header)?;

        for (row, cell) in self.cells.iter().enumerate() {
            let fmt = |v: Option<f64>| v.map(|v| v.to_string()).unwrap_or_default();
            let morph_values = [
                cell.centroid.0.to_string(),
                cell.centroid.1.to_string(),
                cell.area.to_string(),
                cell.eccentricity.to_string(),
            ];
            let mut record: Vec<String> = vec![cell.label.to_string()];
            let mut intensities = self.columns.iter().map(|(_, v)| fmt(v[row]));
            if layout == Layout::Markers {
                record.extend(intensities.next());
            }
            record.extend(morph_values);
            record.extend(intensities);
            wtr.write_record(&record)?;
        }
        Ok(())
    }
}
