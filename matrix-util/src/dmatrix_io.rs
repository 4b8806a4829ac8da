use crate::common_io::{read_lines_of_words_delim, write_lines, Delimiter};
use crate::traits::*;
pub use nalgebra::{DMatrix, DVector};

use std::fmt::{Debug, Display};
use std::str::FromStr;

impl<T> IoOps for DMatrix<T>
where
    T: nalgebra::Scalar + Send + FromStr + Display + Copy,
    <T as FromStr>::Err: Display + Debug,
{
    type Scalar = T;
    type Mat = Self;

    fn read_data(
        file_path: &str,
        delim: impl Into<Delimiter>,
    ) -> anyhow::Result<MatWithNames<Self::Mat>> {
        let parsed = read_lines_of_words_delim(file_path, delim, 0)?;

        // the header may or may not name the row-name column
        let mut cols = parsed.header;
        let nrows = parsed.lines.len();
        if nrows == 0 {
            return Err(anyhow::anyhow!("No data in file {}", file_path));
        }
        let ncols = parsed.lines[0].len().saturating_sub(1);
        if cols.len() == ncols + 1 {
            cols.remove(0);
        }
        if cols.len() != ncols {
            return Err(anyhow::anyhow!(
                "{}: {} column names for {} columns",
                file_path,
                cols.len(),
                ncols
            ));
        }

        let mut rows = Vec::with_capacity(nrows);
        let mut data = Vec::with_capacity(nrows * ncols);

        for (i, words) in parsed.lines.into_iter().enumerate() {
            if words.len() != ncols + 1 {
                return Err(anyhow::anyhow!(
                    "{}: row {} has {} fields, expected {}",
                    file_path,
                    i,
                    words.len(),
                    ncols + 1
                ));
            }
            let mut words = words.into_iter();
            if let Some(name) = words.next() {
                rows.push(name);
            }
            for w in words {
                let x = w
                    .parse::<T>()
                    .map_err(|e| anyhow::anyhow!("{}: row {}: '{}': {}", file_path, i, w, e))?;
                data.push(x);
            }
        }

        Ok(MatWithNames {
            rows,
            cols,
            mat: DMatrix::<T>::from_row_iterator(nrows, ncols, data),
        })
    }

    fn write_data(
        &self,
        rows: &[Box<str>],
        cols: &[Box<str>],
        file: &str,
        delim: &str,
    ) -> anyhow::Result<()> {
        if rows.len() != self.nrows() || cols.len() != self.ncols() {
            return Err(anyhow::anyhow!(
                "names ({} x {}) don't match the matrix ({} x {})",
                rows.len(),
                cols.len(),
                self.nrows(),
                self.ncols()
            ));
        }

        let mut lines = Vec::with_capacity(self.nrows() + 1);
        let hdr = std::iter::once("name")
            .chain(cols.iter().map(|c| c.as_ref()))
            .collect::<Vec<_>>()
            .join(delim);
        lines.push(hdr.into_boxed_str());

        for (name, row) in rows.iter().zip(self.row_iter()) {
            let line = std::iter::once(name.to_string())
                .chain(row.iter().map(|x| format!("{}", *x)))
                .collect::<Vec<_>>()
                .join(delim);
            lines.push(line.into_boxed_str());
        }

        write_lines(&lines, file)
    }
}
