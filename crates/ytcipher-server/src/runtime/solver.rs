//! Solver extraction and invocation.
//!
//! A prepared script (the preprocessor's output) may define two global
//! functions: `decryptSignature` and `decryptNSignature`. [`SolverSet`]
//! probes for them once and then invokes them on demand.
//!
//! Boa's string interner is tied to a specific `Context`, so the prepared
//! source cannot be cached as a parsed program: every invocation evaluates
//! the cached source into a fresh context and calls the function there. That
//! keeps `SolverSet` `Send + Sync` and cheap to clone, at the cost of a
//! re-parse per call.

use std::sync::Arc;

use boa_engine::{js_string, Context, Source};
use boa_engine::value::JsValue;

use ytcipher_common::CipherError;

const SIG_SOLVER_FN: &str = "decryptSignature";
const N_SOLVER_FN: &str = "decryptNSignature";

/// The solver pair extracted from a prepared script. Either solver may be
/// absent; a set with neither is never constructed.
#[derive(Clone, Debug)]
pub struct SolverSet {
    prepared: Arc<str>,
    has_sig: bool,
    has_n: bool,
}

impl SolverSet {
    /// Probes a prepared script for solver functions.
    ///
    /// Returns `Ok(None)` when the script evaluates cleanly but defines
    /// neither solver.
    ///
    /// # Errors
    ///
    /// Returns `CipherError::Evaluation` when the prepared script itself
    /// fails to evaluate.
    pub fn from_prepared(prepared: &str) -> Result<Option<Self>, CipherError> {
        let mut ctx = new_context(prepared)?;
        let has_sig = is_callable_global(&mut ctx, SIG_SOLVER_FN);
        let has_n = is_callable_global(&mut ctx, N_SOLVER_FN);

        if !has_sig && !has_n {
            return Ok(None);
        }

        Ok(Some(Self {
            prepared: Arc::from(prepared),
            has_sig,
            has_n,
        }))
    }

    pub fn has_sig_solver(&self) -> bool {
        self.has_sig
    }

    pub fn has_n_solver(&self) -> bool {
        self.has_n
    }

    /// Decrypts an encrypted signature. Callers must check
    /// [`Self::has_sig_solver`] first.
    pub fn solve_sig(&self, encrypted: &str) -> Result<String, CipherError> {
        self.call(SIG_SOLVER_FN, encrypted)
    }

    /// Decrypts an n-parameter. Callers must check [`Self::has_n_solver`]
    /// first.
    pub fn solve_n(&self, n_param: &str) -> Result<String, CipherError> {
        self.call(N_SOLVER_FN, n_param)
    }

    fn call(&self, func_name: &str, arg: &str) -> Result<String, CipherError> {
        let mut ctx = new_context(&self.prepared)?;

        let global = ctx.global_object();
        let func = global
            .get(js_string!(func_name.to_owned()), &mut ctx)
            .map_err(|e| CipherError::Evaluation(format!("{func_name} lookup failed: {e}")))?;

        let func_obj = match func.as_object() {
            Some(obj) if obj.is_callable() => obj,
            _ => {
                return Err(CipherError::Evaluation(format!(
                    "{func_name} is not callable in the prepared script"
                )))
            }
        };

        let arg = JsValue::new(js_string!(arg.to_owned()));
        let result = func_obj
            .call(&JsValue::undefined(), &[arg], &mut ctx)
            .map_err(|e| CipherError::Evaluation(format!("{func_name} failed: {e}")))?;

        match result.as_string() {
            Some(s) => s
                .to_std_string()
                .map_err(|e| CipherError::Evaluation(format!("{func_name} result invalid: {e:?}"))),
            None => Err(CipherError::Evaluation(format!(
                "{func_name} returned a non-string value"
            ))),
        }
    }
}

fn new_context(source: &str) -> Result<Context, CipherError> {
    let mut ctx = Context::default();
    ctx.eval(Source::from_bytes(source))
        .map_err(|e| CipherError::Evaluation(format!("prepared script failed to evaluate: {e}")))?;
    Ok(ctx)
}

fn is_callable_global(ctx: &mut Context, name: &str) -> bool {
    let global = ctx.global_object();
    global
        .get(js_string!(name.to_owned()), ctx)
        .ok()
        .and_then(|v| v.as_object().cloned())
        .is_some_and(|obj| obj.is_callable())
}
