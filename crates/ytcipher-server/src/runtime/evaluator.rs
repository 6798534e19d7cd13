//! Script evaluation inside a worker.
//!
//! A worker owns one [`Evaluator`] for its whole lifetime. The production
//! evaluator is a Boa context that loads the preprocessor bundle once at
//! construction and then runs `preprocess(source)` per task. Boa's `Context`
//! has thread-local state and is `!Send`, which is why evaluators are
//! constructed by the factory *inside* the worker thread and never leave it.

use std::sync::Arc;

use boa_engine::{js_string, Context, Source};
use boa_engine::value::JsValue;
use thiserror::Error;

use ytcipher_common::CipherError;

/// Name of the global function the preprocessor bundle must define.
const PREPROCESS_FN: &str = "preprocess";

/// How an evaluation can fail, as reported by the worker.
#[derive(Error, Debug)]
pub enum EvalError {
    /// The script itself raised an error.
    #[error("{message}")]
    Script {
        message: String,
        stack: Option<String>,
    },

    /// The script completed but produced something other than a string.
    #[error("evaluation produced a non-string result: {0}")]
    NonString(String),
}

/// One evaluation context: takes a raw player source, returns the prepared
/// script. Implementations may hold arbitrary per-worker state.
pub trait Evaluator {
    fn evaluate(&mut self, input: &str) -> Result<String, EvalError>;
}

/// Constructs an evaluator on the worker thread. Shared across workers, so
/// it must be `Send + Sync`; the evaluator it returns must not be.
pub type EvaluatorFactory =
    Arc<dyn Fn() -> Result<Box<dyn Evaluator>, CipherError> + Send + Sync>;

/// Convenience factory for evaluators backed by a plain Rust closure.
/// Used by tests and by any embedding that does not want a JS engine.
pub fn closure_factory<F>(f: F) -> EvaluatorFactory
where
    F: Fn(&str) -> Result<String, EvalError> + Clone + Send + Sync + 'static,
{
    Arc::new(move || {
        let f = f.clone();
        Ok(Box::new(ClosureEvaluator(f)) as Box<dyn Evaluator>)
    })
}

struct ClosureEvaluator<F>(F);

impl<F> Evaluator for ClosureEvaluator<F>
where
    F: Fn(&str) -> Result<String, EvalError>,
{
    fn evaluate(&mut self, input: &str) -> Result<String, EvalError> {
        (self.0)(input)
    }
}

/// Boa-backed preprocessor evaluator.
///
/// The bundle is evaluated once into a long-lived context; each task then
/// calls the `preprocess` global. Engine state accumulates across calls,
/// which is exactly why workers carry a message budget and are retired when
/// it runs out.
#[derive(Debug)]
pub struct BoaPreprocessor {
    ctx: Context,
}

impl BoaPreprocessor {
    /// Builds a fresh context and evaluates the preprocessor bundle into it.
    pub fn new(bundle: &str) -> Result<Self, CipherError> {
        let mut ctx = Context::default();
        ctx.eval(Source::from_bytes(bundle)).map_err(|e| {
            CipherError::Evaluation(format!("preprocessor bundle failed to evaluate: {e}"))
        })?;
        Ok(Self { ctx })
    }

    /// Factory that parses the bundle once per worker spawn.
    pub fn factory(bundle: Arc<str>) -> EvaluatorFactory {
        Arc::new(move || Ok(Box::new(BoaPreprocessor::new(&bundle)?) as Box<dyn Evaluator>))
    }
}

impl Evaluator for BoaPreprocessor {
    fn evaluate(&mut self, input: &str) -> Result<String, EvalError> {
        let global = self.ctx.global_object();
        let func = global
            .get(js_string!(PREPROCESS_FN), &mut self.ctx)
            .map_err(|e| EvalError::Script {
                message: format!("failed to look up {PREPROCESS_FN}: {e}"),
                stack: None,
            })?;

        let func_obj = match func.as_object() {
            Some(obj) if obj.is_callable() => obj,
            _ => {
                return Err(EvalError::Script {
                    message: format!("bundle does not define a callable {PREPROCESS_FN}"),
                    stack: None,
                })
            }
        };

        let arg = JsValue::new(js_string!(input.to_owned()));
        let result = func_obj
            .call(&JsValue::undefined(), &[arg], &mut self.ctx)
            .map_err(|e| EvalError::Script {
                message: e.to_string(),
                stack: None,
            })?;

        match result.as_string() {
            Some(s) => s.to_std_string().map_err(|e| {
                EvalError::NonString(format!("result is not valid UTF-8: {e:?}"))
            }),
            None => Err(EvalError::NonString(
                "preprocessor returned a non-string value".to_string(),
            )),
        }
    }
}
