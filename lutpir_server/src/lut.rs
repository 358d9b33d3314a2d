use lutpir_common::{branch_opt_util, error::LutPIRError, packet::FuncNo};
use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tracing::info;

/// Single-input function table: `f(inputs[i]) = outputs[i]`.
#[derive(Clone, Debug, PartialEq)]
pub struct OneInputTable {
    inputs: Vec<i64>,
    outputs: Vec<i64>,
}

/// Two-input function table over candidate domains `x0` and `x1`, with
/// `outputs[i0 * n1 + i1] = f(inputs[0][i0], inputs[1][i1])`.
#[derive(Clone, Debug, PartialEq)]
pub struct TwoInputTable {
    inputs: [Vec<i64>; 2],
    outputs: Vec<i64>,
}

/// Where to load function tables from. At least one of them must be set.
#[derive(Clone, Debug, Default)]
pub struct TableFiles {
    pub one_input: Option<PathBuf>,
    /// Input file (two candidate rows) and output file (one row of `n0 * n1` values).
    pub two_input: Option<(PathBuf, PathBuf)>,
}

/// Every function table the computation server evaluates. Immutable once built, shared by all workers.
#[derive(Clone, Debug)]
pub struct LookupTable {
    one_input: Option<OneInputTable>,
    two_input: Option<TwoInputTable>,
}

/// Parses a table file: a header holding the column count, followed by exactly `num_rows` rows of that many integers.
pub fn parse_table_text(text: &str, num_rows: usize) -> Result<Vec<Vec<i64>>, LutPIRError> {
    let mut lines = text.lines().map(str::trim).filter(|line| !line.is_empty());

    let header = lines.next().ok_or_else(|| LutPIRError::MalformedTableHeader("file is empty".to_string()))?;
    let num_cols = header
        .parse::<usize>()
        .map_err(|e| LutPIRError::MalformedTableHeader(format!("'{}': {}", header, e)))?;
    if branch_opt_util::unlikely(num_cols == 0) {
        return Err(LutPIRError::MalformedTableHeader("table must have at least one column".to_string()));
    }

    let rows = lines
        .map(|line| {
            line.split_whitespace()
                .map(|value| value.parse::<i64>().map_err(|e| LutPIRError::InvalidTableValue(format!("'{}': {}", value, e))))
                .collect::<Result<Vec<i64>, LutPIRError>>()
        })
        .collect::<Result<Vec<Vec<i64>>, LutPIRError>>()?;

    if branch_opt_util::unlikely(rows.len() != num_rows) {
        return Err(LutPIRError::TableSizeMismatch {
            declared: num_rows,
            found: rows.len(),
        });
    }
    if let Some(row) = rows.iter().find(|row| row.len() != num_cols) {
        return Err(LutPIRError::TableSizeMismatch {
            declared: num_cols,
            found: row.len(),
        });
    }

    Ok(rows)
}

/// Renders rows in the format `parse_table_text` reads back.
pub fn format_table_text(rows: &[&[i64]]) -> String {
    let num_cols = rows.first().map(|row| row.len()).unwrap_or_default();

    let mut text = format!("{}\n", num_cols);
    rows.iter().for_each(|row| {
        let line = row.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(" ");
        text.push_str(&line);
        text.push('\n');
    });

    text
}

fn read_table_file(path: &Path, num_rows: usize) -> Result<Vec<Vec<i64>>, LutPIRError> {
    let text = fs::read_to_string(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => LutPIRError::TableFileNotFound(path.display().to_string()),
        _ => LutPIRError::from(e),
    })?;

    parse_table_text(&text, num_rows)
}

impl OneInputTable {
    pub fn new(inputs: Vec<i64>, outputs: Vec<i64>) -> Result<Self, LutPIRError> {
        if branch_opt_util::unlikely(inputs.len() != outputs.len()) {
            return Err(LutPIRError::TableSizeMismatch {
                declared: inputs.len(),
                found: outputs.len(),
            });
        }

        Ok(OneInputTable { inputs, outputs })
    }

    pub fn from_fn(inputs: Vec<i64>, f: impl Fn(i64) -> i64) -> Self {
        let outputs = inputs.iter().map(|&x| f(x)).collect();
        OneInputTable { inputs, outputs }
    }

    pub fn load(path: &Path) -> Result<Self, LutPIRError> {
        let mut rows = read_table_file(path, 2)?;

        let outputs = rows.pop().unwrap_or_default();
        let inputs = rows.pop().unwrap_or_default();

        Self::new(inputs, outputs)
    }

    pub fn inputs(&self) -> &[i64] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[i64] {
        &self.outputs
    }

    pub fn to_text(&self) -> String {
        format_table_text(&[self.inputs.as_slice(), self.outputs.as_slice()])
    }
}

impl TwoInputTable {
    pub fn new(x0: Vec<i64>, x1: Vec<i64>, outputs: Vec<i64>) -> Result<Self, LutPIRError> {
        let num_combinations = x0.len() * x1.len();
        if branch_opt_util::unlikely(num_combinations != outputs.len()) {
            return Err(LutPIRError::TableSizeMismatch {
                declared: num_combinations,
                found: outputs.len(),
            });
        }

        Ok(TwoInputTable { inputs: [x0, x1], outputs })
    }

    pub fn from_fn(x0: Vec<i64>, x1: Vec<i64>, f: impl Fn(i64, i64) -> i64) -> Self {
        let outputs = x0.iter().flat_map(|&a| x1.iter().map(move |&b| (a, b))).map(|(a, b)| f(a, b)).collect();
        TwoInputTable { inputs: [x0, x1], outputs }
    }

    pub fn load(input_path: &Path, output_path: &Path) -> Result<Self, LutPIRError> {
        let mut input_rows = read_table_file(input_path, 2)?;
        let mut output_rows = read_table_file(output_path, 1)?;

        let x1 = input_rows.pop().unwrap_or_default();
        let x0 = input_rows.pop().unwrap_or_default();
        let outputs = output_rows.pop().unwrap_or_default();

        Self::new(x0, x1, outputs)
    }

    pub fn inputs(&self) -> &[Vec<i64>; 2] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[i64] {
        &self.outputs
    }

    /// Contents of the input file and the output file, respectively.
    pub fn to_text(&self) -> (String, String) {
        (
            format_table_text(&[self.inputs[0].as_slice(), self.inputs[1].as_slice()]),
            format_table_text(&[self.outputs.as_slice()]),
        )
    }
}

impl LookupTable {
    pub fn new(one_input: Option<OneInputTable>, two_input: Option<TwoInputTable>) -> Result<Self, LutPIRError> {
        if branch_opt_util::unlikely(one_input.is_none() && two_input.is_none()) {
            return Err(LutPIRError::NoFunctionTableConfigured);
        }

        Ok(LookupTable { one_input, two_input })
    }

    /// Loads every configured table file. Any failure here is meant to abort server startup.
    pub fn load(files: &TableFiles) -> Result<Self, LutPIRError> {
        let one_input = files.one_input.as_deref().map(OneInputTable::load).transpose()?;
        let two_input = files
            .two_input
            .as_ref()
            .map(|(input_path, output_path)| TwoInputTable::load(input_path, output_path))
            .transpose()?;

        if let Some(table) = &one_input {
            info!(entries = table.inputs.len(), "loaded one-input lookup table");
        }
        if let Some(table) = &two_input {
            info!(n0 = table.inputs[0].len(), n1 = table.inputs[1].len(), "loaded two-input lookup table");
        }

        Self::new(one_input, two_input)
    }

    /// Candidate input domains of the table `func_no` selects, in input order.
    pub fn input_domains(&self, func_no: FuncNo) -> Result<Vec<&[i64]>, LutPIRError> {
        match func_no {
            FuncNo::OneInput => self
                .one_input
                .as_ref()
                .map(|table| vec![table.inputs()])
                .ok_or(LutPIRError::FunctionTableNotLoaded(func_no as u32)),
            FuncNo::TwoInput => self
                .two_input
                .as_ref()
                .map(|table| vec![table.inputs[0].as_slice(), table.inputs[1].as_slice()])
                .ok_or(LutPIRError::FunctionTableNotLoaded(func_no as u32)),
        }
    }

    /// Outputs of the table `func_no` selects, indexed by the row-major combination of input positions.
    pub fn outputs(&self, func_no: FuncNo) -> Result<&[i64], LutPIRError> {
        match func_no {
            FuncNo::OneInput => self.one_input.as_ref().map(|table| table.outputs()),
            FuncNo::TwoInput => self.two_input.as_ref().map(|table| table.outputs()),
        }
        .ok_or(LutPIRError::FunctionTableNotLoaded(func_no as u32))
    }
}

#[cfg(test)]
mod test {
    use super::{LookupTable, OneInputTable, TableFiles, TwoInputTable, parse_table_text};
    use lutpir_common::{error::LutPIRError, packet::FuncNo};
    use std::{fs, path::PathBuf};
    use test_case::test_case;

    #[test_case("3\n1 2 3\n10 20 30\n", 2 => matches Ok(_); "Well formed one-input table")]
    #[test_case("  3  \n\n1 2 3\n\n-10 20 -30\n\n", 2 => matches Ok(_); "Blank lines and padding are ignored")]
    #[test_case("", 2 => matches Err(LutPIRError::MalformedTableHeader(_)); "Empty file has no header")]
    #[test_case("three\n1 2 3\n10 20 30\n", 2 => matches Err(LutPIRError::MalformedTableHeader(_)); "Header must be an integer")]
    #[test_case("3 2\n1 2 3\n10 20 30\n", 2 => matches Err(LutPIRError::MalformedTableHeader(_)); "Header must be a single integer")]
    #[test_case("0\n\n\n", 2 => matches Err(LutPIRError::MalformedTableHeader(_)); "Header must declare at least one column")]
    #[test_case("4\n1 2 3\n10 20 30\n", 2 => matches Err(LutPIRError::TableSizeMismatch { declared: 4, found: 3 }); "Rows shorter than declared")]
    #[test_case("3\n1 2 3\n", 2 => matches Err(LutPIRError::TableSizeMismatch { declared: 2, found: 1 }); "Missing output row")]
    #[test_case("3\n1 2 3\n10 20 30\n7 8 9\n", 2 => matches Err(LutPIRError::TableSizeMismatch { declared: 2, found: 3 }); "Too many rows")]
    #[test_case("3\n1 2 x\n10 20 30\n", 2 => matches Err(LutPIRError::InvalidTableValue(_)); "Non integer entry")]
    fn table_file_validation(text: &str, num_rows: usize) -> Result<Vec<Vec<i64>>, LutPIRError> {
        parse_table_text(text, num_rows)
    }

    fn temp_table_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("lutpir-{}-{}.txt", std::process::id(), name))
    }

    #[test]
    fn one_input_table_survives_file_round_trip() {
        let table = OneInputTable::from_fn((-8..8).collect(), |x| x * x - 3);
        let path = temp_table_path("one-input");
        fs::write(&path, table.to_text()).unwrap();

        let loaded = OneInputTable::load(&path);
        fs::remove_file(&path).unwrap();

        assert_eq!(loaded, Ok(table));
    }

    #[test]
    fn two_input_output_file_must_cover_every_combination() {
        let input_path = temp_table_path("two-input-in");
        let output_path = temp_table_path("two-input-out");
        fs::write(&input_path, "3\n1 2 3\n4 5 6\n").unwrap();
        fs::write(&output_path, "8\n1 2 3 4 5 6 7 8\n").unwrap();

        let loaded = TwoInputTable::load(&input_path, &output_path);
        fs::remove_file(&input_path).unwrap();
        fs::remove_file(&output_path).unwrap();

        assert_eq!(loaded, Err(LutPIRError::TableSizeMismatch { declared: 9, found: 8 }));
    }

    #[test]
    fn missing_table_file_is_reported() {
        let files = TableFiles {
            one_input: Some(temp_table_path("does-not-exist")),
            two_input: None,
        };

        assert!(matches!(LookupTable::load(&files), Err(LutPIRError::TableFileNotFound(_))));
    }

    #[test]
    fn at_least_one_table_must_be_configured() {
        assert!(matches!(LookupTable::load(&TableFiles::default()), Err(LutPIRError::NoFunctionTableConfigured)));
    }

    #[test]
    fn unloaded_function_is_not_found() {
        let lut = LookupTable::new(Some(OneInputTable::from_fn(vec![1, 2, 3], |x| x + 1)), None).unwrap();

        assert_eq!(lut.input_domains(FuncNo::OneInput).unwrap(), vec![&[1i64, 2, 3][..]]);
        assert_eq!(lut.outputs(FuncNo::TwoInput), Err(LutPIRError::FunctionTableNotLoaded(2)));
    }

    #[test]
    fn two_input_outputs_are_row_major_over_inputs() {
        let table = TwoInputTable::from_fn(vec![1, 2], vec![10, 20, 30], |a, b| a * b);
        assert_eq!(table.outputs(), &[10, 20, 30, 20, 40, 60]);
    }
}
