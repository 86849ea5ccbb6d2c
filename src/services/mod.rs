pub mod allocator;
pub mod checkout;
pub mod intake;
pub mod ledger;
pub mod lock;
pub mod refunds;
pub mod reservation;
pub mod rewards;
pub mod scheduler;
pub mod webhook;
pub mod withdrawals;
pub mod worker;

pub use allocator::BatchAllocator;
pub use checkout::{CheckoutRequest, CheckoutService, CheckoutSession};
pub use intake::{EventIntake, IntakeOutcome};
pub use ledger::LedgerService;
pub use lock::{lock_key, LockManager, LockOptions};
pub use refunds::RefundService;
pub use reservation::ReservationCoordinator;
pub use rewards::RewardService;
pub use scheduler::ExpiryScheduler;
pub use webhook::{HandlerOutcome, WebhookProcessor};
pub use withdrawals::WithdrawalService;
pub use worker::{JobResult, WorkerPool, WorkerSettings};
