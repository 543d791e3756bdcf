use mri_core::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};

/// One element of a flat recipe array: an electrode label at even indices,
/// a signed current (mA) at odd indices. `untagged` so the wire format is
/// exactly `["F3", -2, "F4", 2]`, matching `roast_run.m`'s input and the
/// original system's `recipe[1::2]` current extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecipeValue {
    Electrode(String),
    Current(f64),
}

pub type Recipe = Vec<RecipeValue>;

/// Validates that `recipe` alternates electrode label and signed current
/// (mA) and that the currents sum to zero within `1e-9`, matching the
/// original system's validator exactly.
pub fn validate_recipe(recipe: &[RecipeValue]) -> CoreResult<()> {
    if recipe.is_empty() || recipe.len() % 2 != 0 {
        return Err(CoreError::InputInvalid(
            "recipe must have an even number of elements (electrode, current pairs)".into(),
        ));
    }

    let mut currents = Vec::with_capacity(recipe.len() / 2);
    for (i, entry) in recipe.iter().enumerate() {
        match (i % 2, entry) {
            (0, RecipeValue::Electrode(_)) => {}
            (1, RecipeValue::Current(ma)) => currents.push(*ma),
            (0, RecipeValue::Current(_)) => {
                return Err(CoreError::InputInvalid(format!("recipe entry at index {i} must be an electrode label")))
            }
            (_, RecipeValue::Electrode(_)) => {
                return Err(CoreError::InputInvalid(format!("recipe entry at index {i} must be a numeric current")))
            }
        }
    }

    for ma in &currents {
        if !ma.is_finite() {
            return Err(CoreError::InputInvalid(format!("recipe currents must be finite numbers, got {ma}")));
        }
    }

    let sum: f64 = currents.iter().sum();
    if sum.abs() > 1e-9 {
        return Err(CoreError::InputInvalid(format!(
            "recipe currents must sum to 0 mA (got {sum:.4}); anode and cathode currents must balance"
        )));
    }

    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshOptions {
    pub radbound: f64,
    pub angbound: f64,
    pub distbound: f64,
    pub reratio: f64,
    pub maxvol: f64,
}

impl Default for MeshOptions {
    fn default() -> Self {
        Self {
            radbound: 5.0,
            angbound: 30.0,
            distbound: 0.3,
            reratio: 3.0,
            maxvol: 10.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectrodeSize {
    pub width_mm: f64,
    pub length_mm: f64,
    pub thickness_mm: f64,
}

/// The JSON configuration file written to the ROAST simulation working
/// directory and read by the external `roast_run` binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoastConfig {
    pub t1_path: String,
    pub recipe: Recipe,
    pub electype: Vec<String>,
    pub elecsize: Vec<ElectrodeSize>,
    pub elecori: Vec<String>,
    pub meshoptions: MeshOptions,
    pub simulationtag: String,
}

pub const COND_GEL: f64 = 0.3;
pub const COND_ELECTRODE: f64 = 5.9e7;

impl RoastConfig {
    pub fn new(t1_path: String, recipe: Recipe) -> CoreResult<Self> {
        validate_recipe(&recipe)?;
        let electrode_count = recipe.len() / 2;
        Ok(Self {
            t1_path,
            recipe,
            electype: vec!["pad".to_string(); electrode_count],
            elecsize: vec![
                ElectrodeSize {
                    width_mm: 70.0,
                    length_mm: 50.0,
                    thickness_mm: 3.0,
                };
                electrode_count
            ],
            elecori: vec!["lr".to_string(); electrode_count],
            meshoptions: MeshOptions::default(),
            simulationtag: "tDCSLAB".to_string(),
        })
    }

    pub fn default_recipe() -> Recipe {
        vec![
            RecipeValue::Electrode("F3".to_string()),
            RecipeValue::Current(-2.0),
            RecipeValue::Electrode("F4".to_string()),
            RecipeValue::Current(2.0),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recipe(pairs: &[(&str, f64)]) -> Recipe {
        pairs
            .iter()
            .flat_map(|(label, ma)| vec![RecipeValue::Electrode(label.to_string()), RecipeValue::Current(*ma)])
            .collect()
    }

    #[test]
    fn rejects_odd_length() {
        let recipe = vec![RecipeValue::Electrode("F3".into()), RecipeValue::Current(-2.0), RecipeValue::Electrode("F4".into())];
        let err = validate_recipe(&recipe).unwrap_err();
        assert_eq!(err.kind(), "input_invalid");
    }

    #[test]
    fn rejects_a_current_where_an_electrode_label_belongs() {
        let recipe = vec![RecipeValue::Current(1.0), RecipeValue::Current(-1.0)];
        let err = validate_recipe(&recipe).unwrap_err();
        assert_eq!(err.kind(), "input_invalid");
    }

    #[test]
    fn rejects_unbalanced_currents() {
        let err = validate_recipe(&recipe(&[("F3", 1.5), ("F4", -1.0)])).unwrap_err();
        assert_eq!(err.kind(), "input_invalid");
        assert!(err.to_string().contains("0.5"));
    }

    #[test]
    fn accepts_currents_within_epsilon_of_zero() {
        assert!(validate_recipe(&recipe(&[("F3", 2.0), ("F4", -1.9999999995)])).is_ok());
    }

    #[test]
    fn default_recipe_is_valid() {
        assert!(validate_recipe(&RoastConfig::default_recipe()).is_ok());
    }

    #[test]
    fn flat_wire_format_round_trips_through_json() {
        let recipe = RoastConfig::default_recipe();
        let json = serde_json::to_value(&recipe).unwrap();
        assert_eq!(json, serde_json::json!(["F3", -2.0, "F4", 2.0]));

        let parsed: Recipe = serde_json::from_value(serde_json::json!(["F3", 1.5, "F4", -1.0])).unwrap();
        assert_eq!(parsed, recipe(&[("F3", 1.5), ("F4", -1.0)]));
    }
}
