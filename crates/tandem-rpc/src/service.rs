//! Demonstration `arith` service.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tandem_core::{Registrar, Service};
use thiserror::Error;

/// Two integer operands, sent as one positional param.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Operands {
    pub a: i64,
    pub b: i64,
}

#[derive(Debug, Error)]
pub enum ArithError {
    #[error("divide by zero")]
    DivideByZero,

    #[error("integer overflow")]
    Overflow,
}

/// Integer arithmetic plus a few methods for exercising the runtime.
#[derive(Debug, Default)]
pub struct Arith {
    served: AtomicU64,
}

impl Arith {
    fn tick(&self) {
        self.served.fetch_add(1, Ordering::Relaxed);
    }

    fn add(&self, ops: Operands) -> Result<i64, ArithError> {
        self.tick();
        ops.a.checked_add(ops.b).ok_or(ArithError::Overflow)
    }

    fn sub(&self, ops: Operands) -> Result<i64, ArithError> {
        self.tick();
        ops.a.checked_sub(ops.b).ok_or(ArithError::Overflow)
    }

    fn mul(&self, ops: Operands) -> Result<i64, ArithError> {
        self.tick();
        ops.a.checked_mul(ops.b).ok_or(ArithError::Overflow)
    }

    fn div(&self, ops: Operands) -> Result<i64, ArithError> {
        self.tick();
        if ops.b == 0 {
            return Err(ArithError::DivideByZero);
        }
        ops.a.checked_div(ops.b).ok_or(ArithError::Overflow)
    }

    fn sum(&self, values: Vec<i64>) -> Result<i64, ArithError> {
        self.tick();
        values
            .into_iter()
            .try_fold(0i64, |acc, v| acc.checked_add(v))
            .ok_or(ArithError::Overflow)
    }

    async fn sleep(&self, ms: u64) -> Result<u64, ArithError> {
        self.tick();
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(ms)
    }

    pub fn served(&self) -> u64 {
        self.served.load(Ordering::Relaxed)
    }
}

impl Service for Arith {
    fn register_methods(self: Arc<Self>, registrar: &mut Registrar<'_>) {
        let add = Arc::clone(&self);
        let sub = Arc::clone(&self);
        let mul = Arc::clone(&self);
        let div = Arc::clone(&self);
        let sum = Arc::clone(&self);
        let sleep = Arc::clone(&self);
        let stats = Arc::clone(&self);

        registrar
            .method_sync("Add", move |(ops,): (Operands,)| add.add(ops))
            .method_sync("Sub", move |(ops,): (Operands,)| sub.sub(ops))
            .method_sync("Mul", move |(ops,): (Operands,)| mul.mul(ops))
            .method_sync("Div", move |(ops,): (Operands,)| div.div(ops))
            .method_sync("Sum", move |(values,): (Vec<i64>,)| sum.sum(values))
            .method("Sleep", move |(ms,): (u64,)| {
                let sleep = Arc::clone(&sleep);
                async move { sleep.sleep(ms).await }
            })
            .method_sync("Served", move |()| Ok::<_, ArithError>(stats.served()))
            .method_sync("Panic", |(message,): (String,)| -> Result<(), ArithError> {
                panic!("{}", message)
            });
    }
}
