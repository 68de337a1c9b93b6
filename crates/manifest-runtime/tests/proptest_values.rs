//! Property tests for value coercion and operator semantics.

use manifest_runtime::evaluator::{apply_binary, render_template};
use manifest_runtime::prelude::*;
use proptest::prelude::*;
use serde_json::json;

fn scalar_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Undefined),
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        (-1.0e6f64..1.0e6).prop_map(Value::Number),
        "[a-z0-9 ]{0,8}".prop_map(Value::String),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(1_000))]

    #[test]
    fn equality_operators_are_complementary(a in scalar_strategy(), b in scalar_strategy()) {
        let eq = apply_binary("==", &a, &b).truthy();
        let ne = apply_binary("!=", &a, &b).truthy();
        prop_assert_ne!(eq, ne);
        prop_assert_eq!(eq, apply_binary("==", &b, &a).truthy());
    }

    #[test]
    fn comparisons_agree_with_numbers(a in -1.0e6f64..1.0e6, b in -1.0e6f64..1.0e6) {
        let (x, y) = (Value::from(a), Value::from(b));
        prop_assert_eq!(apply_binary("<", &x, &y).truthy(), a < b);
        prop_assert_eq!(apply_binary(">=", &x, &y).truthy(), a >= b);
        prop_assert_eq!(apply_binary("+", &x, &y), Value::from(a + b));
    }

    #[test]
    fn nan_is_never_ordered(a in scalar_strategy()) {
        let nan = Value::from(f64::NAN);
        for op in ["<", "<=", ">", ">="] {
            prop_assert!(!apply_binary(op, &nan, &a).truthy());
        }
    }

    #[test]
    fn plain_text_renders_unchanged(text in "[^$]{0,40}") {
        prop_assert_eq!(render_template(&text, &Context::new()), text);
    }

    #[test]
    fn integral_numbers_serialize_as_integers(n in -1_000_000i64..1_000_000) {
        prop_assert_eq!(Value::from(n as f64).to_json(), json!(n));
    }
}
