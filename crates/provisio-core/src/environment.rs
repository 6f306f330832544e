use crate::error::{ProvisionError, Result};
use crate::instruction::ProvisionUnitInstruction;

/// Ordered map of unit name to unit instruction, in application order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisionEnvironmentInstruction {
    units: Vec<ProvisionUnitInstruction>,
}

impl ProvisionEnvironmentInstruction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_units(units: impl IntoIterator<Item = ProvisionUnitInstruction>) -> Result<Self> {
        let mut instruction = Self::new();
        for unit in units {
            instruction.insert(unit)?;
        }
        Ok(instruction)
    }

    pub fn insert(&mut self, unit: ProvisionUnitInstruction) -> Result<()> {
        if self.unit(unit.unit_name()).is_some() {
            return Err(ProvisionError::invalid_instruction(format!(
                "duplicate instruction for unit '{}'",
                unit.unit_name()
            )));
        }
        self.units.push(unit);
        Ok(())
    }

    pub fn with_unit(mut self, unit: ProvisionUnitInstruction) -> Result<Self> {
        self.insert(unit)?;
        Ok(self)
    }

    pub fn unit(&self, name: &str) -> Option<&ProvisionUnitInstruction> {
        self.units.iter().find(|unit| unit.unit_name() == name)
    }

    pub fn units(&self) -> &[ProvisionUnitInstruction] {
        &self.units
    }

    pub fn unit_names(&self) -> impl Iterator<Item = &str> {
        self.units.iter().map(ProvisionUnitInstruction::unit_name)
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    /// Structural inverse: every unit instruction rolled back, in reverse order.
    pub fn rollback(&self) -> Self {
        Self {
            units: self
                .units
                .iter()
                .rev()
                .map(ProvisionUnitInstruction::rollback)
                .collect(),
        }
    }

    /// Composes `self` followed by `next`. Units named by only one side are
    /// carried through; units in both are merged and dropped when they cancel.
    pub fn merge_with(&self, next: &Self) -> Result<Self> {
        let mut units = Vec::with_capacity(self.units.len() + next.units.len());
        for unit in &self.units {
            match next.unit(unit.unit_name()) {
                Some(next_unit) => {
                    if let Some(merged) = unit.merge_with(next_unit)? {
                        units.push(merged);
                    }
                }
                None => units.push(unit.clone()),
            }
        }
        units.extend(
            next.units
                .iter()
                .filter(|unit| self.unit(unit.unit_name()).is_none())
                .cloned(),
        );
        Ok(Self { units })
    }
}
