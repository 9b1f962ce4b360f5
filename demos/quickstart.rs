//! A minimal example demonstrating the decision loop end to end.
//!
//! Run with: `cargo run --example quickstart`

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tidemark::{
    AccessStrategy, Category, Decider, DomainEvent, Fold, LoadOption,
    codec::Json,
    store::{StreamName, memory::MemoryLog},
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountEvent {
    Opened { initial_balance: i64 },
    Deposited { amount: i64 },
}

impl DomainEvent for AccountEvent {
    fn kind(&self) -> &'static str {
        match self {
            Self::Opened { .. } => "account.opened",
            Self::Deposited { .. } => "account.deposited",
        }
    }
}

/// `None` until the account is opened, then the running balance.
pub struct AccountFold;

impl Fold for AccountFold {
    type Event = AccountEvent;
    type State = Option<i64>;

    fn initial(&self) -> Option<i64> {
        None
    }

    fn fold(&self, state: Option<i64>, events: &[AccountEvent]) -> Option<i64> {
        events.iter().fold(state, |state, event| match event {
            AccountEvent::Opened { initial_balance } => Some(*initial_balance),
            AccountEvent::Deposited { amount } => state.map(|balance| balance + amount),
        })
    }
}

fn decide_deposit(state: &Option<i64>, amount: i64) -> (Result<(), String>, Vec<AccountEvent>) {
    match state {
        None => (Err("account is not open".to_owned()), Vec::new()),
        Some(_) => (Ok(()), vec![AccountEvent::Deposited { amount }]),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let category = Arc::new(Category::new(
        MemoryLog::new(),
        Json::new(),
        AccountFold,
        AccessStrategy::Unrestricted,
        None,
    )?);

    let stream = StreamName::compose("Account", &["alice"]);
    let decider = Decider::new(category, stream);

    // Open the account, idempotently.
    decider
        .transact(
            |state| match state {
                Some(_) => Vec::new(),
                None => vec![AccountEvent::Opened {
                    initial_balance: 100,
                }],
            },
            LoadOption::default(),
        )
        .await?;

    // Deposit through the decision loop; conflicts would retry and re-decide.
    let outcome = decider
        .transact_result(|state| decide_deposit(state, 25), LoadOption::default())
        .await?;
    outcome.expect("the account was opened above");

    let (version, balance) = decider
        .query_ex(
            |ctx| (ctx.version(), *ctx.state()),
            LoadOption::default(),
        )
        .await?;
    println!("balance after {version} events: {balance:?}");
    Ok(())
}
