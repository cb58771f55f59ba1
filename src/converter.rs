//! Raw register to temperature conversion
//!
//! Two modes are supported:
//! - **builtin**: the register holds a 16-bit two's-complement value in
//!   0.1 °C steps (`0x0190` is 40.0 °C, `0xFE70` is -40.0 °C)
//! - **custom**: a user formula over `registerValue`, evaluated by a
//!   restricted expression interpreter (arithmetic, comparisons, `if(c, a, b)`
//!   and a few helper functions). The interpreter has no access to anything
//!   but the register value, and assignments are rejected.
//!
//! Conversion never fails for the caller: invalid input becomes 0 and a
//! failing formula falls back to the builtin rule, with the problem reported
//! alongside the value.

use evalexpr::{
    ContextWithMutableFunctions, ContextWithMutableVariables, EvalexprError, Function,
    HashMapContext, Node, Value,
};
use log::{debug, warn};

use crate::config::{ConversionMode, TemperatureConversionConfig};
use crate::error::{ThermoError, ThermoResult};

/// Name of the formula's only input
pub const REGISTER_VALUE: &str = "registerValue";

/// Result of converting one raw value
#[derive(Debug, Clone, PartialEq)]
pub struct Conversion {
    pub temperature: f64,
    /// Raw value actually converted (after sanitising the input)
    pub raw_value: u16,
    /// Non-fatal problem encountered on the way
    pub error: Option<ThermoError>,
}

/// Builtin rule: two's-complement decode with 0.1 °C resolution
pub fn builtin_convert(raw: u16) -> f64 {
    if raw > 32767 {
        (raw as i32 - 65536) as f64 * 0.1
    } else {
        raw as f64 * 0.1
    }
}

/// Inverse of [`builtin_convert`], saturating at the 16-bit limits
pub fn encode_builtin(celsius: f64) -> u16 {
    if !celsius.is_finite() {
        return 0;
    }
    let tenths = (celsius * 10.0).round().clamp(i16::MIN as f64, i16::MAX as f64);
    tenths as i16 as u16
}

/// Map arbitrary numeric input onto a register value
///
/// Non-finite and out-of-range input is replaced by 0 and reported.
pub fn sanitize_raw(raw: f64) -> (u16, Option<ThermoError>) {
    if raw.is_finite() && (0.0..=65535.0).contains(&raw) {
        (raw as u16, None)
    } else {
        (
            0,
            Some(ThermoError::invalid_data(format!(
                "Raw value {} outside 0..65535, using 0",
                raw
            ))),
        )
    }
}

/// Convert one raw value with a one-off converter
pub fn convert(raw: f64, config: &TemperatureConversionConfig) -> f64 {
    TemperatureConverter::new(config.clone()).convert(raw).temperature
}

/// Converter holding a compiled formula
pub struct TemperatureConverter {
    config: TemperatureConversionConfig,
    formula: Option<Result<Node, ThermoError>>,
    context: HashMapContext,
}

impl TemperatureConverter {
    /// Create a converter; custom formulas are compiled once here
    pub fn new(config: TemperatureConversionConfig) -> Self {
        let formula = match config.mode {
            ConversionMode::Builtin => None,
            ConversionMode::Custom => {
                let compiled = compile_formula(&config.custom_formula);
                if let Err(ref e) = compiled {
                    warn!("Custom formula rejected, using builtin conversion: {}", e);
                }
                Some(compiled)
            }
        };

        Self {
            config,
            formula,
            context: formula_context(),
        }
    }

    /// Converter using the builtin rule
    pub fn builtin() -> Self {
        Self::new(TemperatureConversionConfig::default())
    }

    pub fn config(&self) -> &TemperatureConversionConfig {
        &self.config
    }

    pub fn mode(&self) -> ConversionMode {
        self.config.mode
    }

    /// Convert a raw value of any numeric origin
    pub fn convert(&self, raw: f64) -> Conversion {
        let (raw_value, input_error) = sanitize_raw(raw);
        if let Some(ref e) = input_error {
            warn!("Conversion warning: {}", e);
        }

        let mut conversion = self.convert_register(raw_value);
        if conversion.error.is_none() {
            conversion.error = input_error;
        }
        conversion
    }

    /// Convert a register value
    pub fn convert_register(&self, raw: u16) -> Conversion {
        let formula = match &self.formula {
            None => {
                return Conversion {
                    temperature: builtin_convert(raw),
                    raw_value: raw,
                    error: None,
                }
            }
            Some(formula) => formula,
        };

        let evaluated = formula
            .as_ref()
            .map_err(Clone::clone)
            .and_then(|node| self.evaluate(node, raw));

        match evaluated {
            Ok(temperature) => Conversion {
                temperature,
                raw_value: raw,
                error: None,
            },
            Err(e) => {
                debug!("Formula fallback for raw value {}: {}", raw, e);
                Conversion {
                    temperature: builtin_convert(raw),
                    raw_value: raw,
                    error: Some(e),
                }
            }
        }
    }

    /// Convert the configured test value, for previewing a formula
    pub fn preview(&self) -> Conversion {
        self.convert(self.config.test_value as f64)
    }

    fn evaluate(&self, node: &Node, raw: u16) -> ThermoResult<f64> {
        let mut context = self.context.clone();
        context
            .set_value(REGISTER_VALUE.to_string(), Value::Float(raw as f64))
            .map_err(|e| self.formula_error(e))?;

        let value = node
            .eval_with_context(&context)
            .map_err(|e| self.formula_error(e))?;

        let number = match value {
            Value::Float(f) => f,
            Value::Int(i) => i as f64,
            other => {
                return Err(ThermoError::formula(
                    &self.config.custom_formula,
                    format!("result is not a number: {}", other),
                ))
            }
        };

        if !number.is_finite() {
            return Err(ThermoError::formula(
                &self.config.custom_formula,
                format!("result is not finite: {}", number),
            ));
        }
        Ok(number)
    }

    fn formula_error(&self, error: EvalexprError) -> ThermoError {
        ThermoError::formula(&self.config.custom_formula, error.to_string())
    }
}

/// Check a formula without building a converter
///
/// Compiles it and evaluates it once against `test_value`.
pub fn validate_formula(formula: &str, test_value: u16) -> ThermoResult<f64> {
    let converter = TemperatureConverter::new(TemperatureConversionConfig {
        mode: ConversionMode::Custom,
        custom_formula: formula.to_string(),
        test_value: test_value as i64,
    });
    let conversion = converter.convert_register(test_value);
    match conversion.error {
        Some(e) => Err(e),
        None => Ok(conversion.temperature),
    }
}

fn compile_formula(formula: &str) -> ThermoResult<Node> {
    if formula.trim().is_empty() {
        return Err(ThermoError::formula(formula, "formula is empty"));
    }
    evalexpr::build_operator_tree(formula)
        .map_err(|e| ThermoError::formula(formula, e.to_string()))
}

/// Context with the helper functions formulas may call
fn formula_context() -> HashMapContext {
    fn number(value: &Value) -> Result<f64, EvalexprError> {
        value.as_number()
    }

    let mut context = HashMapContext::new();
    let functions: [(&str, Function); 3] = [
        (
            "signed16",
            Function::new(|argument| {
                let value = number(argument)?;
                if !(0.0..=65535.0).contains(&value) {
                    return Err(EvalexprError::CustomMessage(format!(
                        "signed16 expects 0..65535, got {}",
                        value
                    )));
                }
                Ok(Value::Float(((value as u16) as i16) as f64))
            }),
        ),
        (
            "abs",
            Function::new(|argument| Ok(Value::Float(number(argument)?.abs()))),
        ),
        (
            "clamp",
            Function::new(|arguments| {
                let tuple = arguments.as_tuple()?;
                if tuple.len() != 3 {
                    return Err(EvalexprError::CustomMessage(format!(
                        "clamp expects 3 arguments, got {}",
                        tuple.len()
                    )));
                }
                let (value, low, high) = (number(&tuple[0])?, number(&tuple[1])?, number(&tuple[2])?);
                Ok(Value::Float(value.max(low).min(high)))
            }),
        ),
    ];

    for (name, function) in functions {
        // Registering into a fresh context cannot collide
        let _ = context.set_function(name.to_string(), function);
    }
    context
}
