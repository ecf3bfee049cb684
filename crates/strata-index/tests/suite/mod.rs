mod dependencies;
mod prefetch;
mod support;
mod transaction;
mod worker_chain;
