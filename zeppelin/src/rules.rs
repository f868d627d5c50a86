use log::{error, warn};
use serde_json::{Map, Value};

/// Combine a pipeline's validation rules with the globally declared ones.
/// With `apply_global` the global rules are laid over the pipeline's (the
/// global value wins on a key collision); otherwise only the global unit
/// whitelist is adopted.
pub fn merge_rules(
    mut pipeline_rules: Map<String, Value>,
    global_rules: &Map<String, Value>,
    apply_global: bool,
) -> Map<String, Value> {
    if apply_global {
        for (key, value) in global_rules {
            pipeline_rules.insert(key.clone(), value.clone());
        }
    } else if let Some(units) = global_rules.get("units") {
        pipeline_rules.insert("units".to_owned(), units.clone());
    }

    pipeline_rules
}

/// Validates `values` records against the pipeline's rules: each record must
/// carry a `value` matching its declared `value_type`, and a `unit` found in
/// the whitelist when one is configured.
pub struct RulesEngine {
    units: Option<Vec<String>>,
}

impl RulesEngine {
    pub fn new(rules: &Map<String, Value>) -> Self {
        let units = rules.get("units").and_then(Value::as_array).map(|list| {
            list.iter()
                .filter_map(Value::as_str)
                .map(str::to_lowercase)
                .collect()
        });

        RulesEngine { units }
    }

    pub fn check_values(&self, values: &[Value]) -> bool {
        for item in values {
            let value = item.get("value").filter(|v| !v.is_null());
            let value_type = item.get("value_type").and_then(Value::as_str);

            let (Some(value), Some(value_type)) = (value, value_type) else {
                error!("invalid value or value_type in record({item})");
                return false;
            };

            let type_ok = match value_type {
                "string" => value.is_string(),
                // json has one integer kind; uint shares it
                "int" | "uint" => value.is_i64() || value.is_u64(),
                "float" => value.is_number(),
                _ => true,
            };

            if !type_ok {
                error!("invalid value({value}) for value_type({value_type})");
                return false;
            }

            let Some(unit) = item.get("unit").and_then(Value::as_str) else {
                error!("invalid unit in record({item})");
                return false;
            };

            match &self.units {
                None => warn!("no unit whitelist configured"),
                Some(units) => {
                    let unit = unit.to_lowercase();
                    if !unit.is_empty() && !units.contains(&unit) {
                        error!("invalid unit({unit}) not listed in units({units:?})");
                        return false;
                    }
                }
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn engine(units: Value) -> RulesEngine {
        let mut rules = Map::new();
        rules.insert("units".to_owned(), units);
        RulesEngine::new(&rules)
    }

    #[test]
    fn accepts_matching_types_and_units() {
        let engine = engine(json!(["kw", "c"]));
        let values = [
            json!({"value": 1.2, "value_type": "float", "unit": "kW"}),
            json!({"value": 3, "value_type": "float", "unit": "kw"}),
            json!({"value": -2, "value_type": "int", "unit": "C"}),
            json!({"value": "on", "value_type": "string", "unit": ""}),
        ];
        assert!(engine.check_values(&values));
    }

    #[test]
    fn rejects_type_mismatches() {
        let engine = engine(json!(["kw"]));

        assert!(!engine.check_values(&[json!({"value": "1.2", "value_type": "float", "unit": "kw"})]));
        assert!(!engine.check_values(&[json!({"value": 1.5, "value_type": "int", "unit": "kw"})]));
        assert!(!engine.check_values(&[json!({"value": 7, "value_type": "string", "unit": "kw"})]));
    }

    #[test]
    fn rejects_missing_fields_and_unknown_units() {
        let engine = engine(json!(["kw"]));

        assert!(!engine.check_values(&[json!({"value_type": "float", "unit": "kw"})]));
        assert!(!engine.check_values(&[json!({"value": 1.0, "unit": "kw"})]));
        assert!(!engine.check_values(&[json!({"value": 1.0, "value_type": "float"})]));
        assert!(!engine.check_values(&[json!({"value": 1.0, "value_type": "float", "unit": "w"})]));
    }

    #[test]
    fn no_whitelist_accepts_any_unit() {
        let engine = RulesEngine::new(&Map::new());
        assert!(engine.check_values(&[json!({"value": 1.0, "value_type": "float", "unit": "w"})]));
    }

    #[test]
    fn global_rules_win_when_applied() {
        let mut pipeline = Map::new();
        pipeline.insert("units".to_owned(), json!(["local"]));
        pipeline.insert("extra".to_owned(), json!(true));

        let mut global = Map::new();
        global.insert("units".to_owned(), json!(["global"]));

        let merged = merge_rules(pipeline.clone(), &global, true);
        assert_eq!(merged["units"], json!(["global"]));
        assert_eq!(merged["extra"], json!(true));

        let merged = merge_rules(pipeline, &global, false);
        assert_eq!(merged["units"], json!(["global"]));
    }
}
