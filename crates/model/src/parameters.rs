use std::collections::BTreeMap;
use std::fmt;

use candle_core::Var;

/// Trainable parameter counts grouped by dotted name prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterReport {
    pub total: usize,
    /// First name segment (`encoder`, `decoder`).
    pub coarse: BTreeMap<String, usize>,
    /// First two name segments (`decoder.embedding`).
    pub fine: BTreeMap<String, usize>,
}

impl ParameterReport {
    pub fn from_parameters(parameters: &[(String, Var)]) -> Self {
        let mut report = Self {
            total: 0,
            coarse: BTreeMap::new(),
            fine: BTreeMap::new(),
        };
        for (name, var) in parameters {
            let count = var.as_tensor().elem_count();
            report.total += count;
            *report.coarse.entry(prefix(name, 1)).or_default() += count;
            *report.fine.entry(prefix(name, 2)).or_default() += count;
        }
        report
    }
}

fn prefix(name: &str, depth: usize) -> String {
    name.split('.').take(depth).collect::<Vec<_>>().join(".")
}

impl fmt::Display for ParameterReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "trainable parameters: {}", self.total)?;
        for (module, count) in &self.coarse {
            writeln!(f, "  {module:<24} {count:>12}")?;
            let scope = format!("{module}.");
            for (child, child_count) in self
                .fine
                .iter()
                .filter(|(child, _)| child.starts_with(&scope))
            {
                writeln!(f, "    {child:<22} {child_count:>12}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device};

    use super::*;

    #[test]
    fn groups_by_prefix() -> candle_core::Result<()> {
        let device = Device::Cpu;
        let params = vec![
            ("encoder.patch.weight".to_string(), Var::zeros((3, 4), DType::F32, &device)?),
            ("decoder.embedding.weight".to_string(), Var::zeros((10, 4), DType::F32, &device)?),
            ("decoder.output.bias".to_string(), Var::zeros(10, DType::F32, &device)?),
        ];
        let report = ParameterReport::from_parameters(&params);
        assert_eq!(report.total, 62);
        assert_eq!(report.coarse["decoder"], 50);
        assert_eq!(report.fine["decoder.embedding"], 40);
        assert!(report.to_string().contains("encoder.patch"));
        Ok(())
    }
}
