//! Per-pass unit of work over the root's persistent services.
//!
//! A [`Transaction`] is opened when a root's scan starts and finished exactly once when
//! the scan ends. Services are registered in a fixed order and committed or rolled
//! back in that same order; a failure in one service never prevents the others from
//! running.

use std::any::Any;
use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;

use strata_core::RootUrl;

use crate::error::{IndexError, Phase, TransactionError};

thread_local! {
    static ACTIVE: Cell<bool> = const { Cell::new(false) };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    Artifacts,
    GeneratedFiles,
    PersistentIndex,
    CacheAttributes,
    ClassIndexEvents,
    ModifiedFiles,
    Extension(&'static str),
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceKind::Artifacts => f.write_str("artifacts"),
            ServiceKind::GeneratedFiles => f.write_str("generated-files"),
            ServiceKind::PersistentIndex => f.write_str("persistent-index"),
            ServiceKind::CacheAttributes => f.write_str("cache-attributes"),
            ServiceKind::ClassIndexEvents => f.write_str("class-index-events"),
            ServiceKind::ModifiedFiles => f.write_str("modified-files"),
            ServiceKind::Extension(name) => write!(f, "extension:{name}"),
        }
    }
}

/// A participant in a [`Transaction`].
pub trait Service: Any + Send {
    fn commit(&mut self) -> Result<(), IndexError>;

    fn roll_back(&mut self) -> Result<(), IndexError>;
}

/// A service addressable by type through [`Transaction::get`].
pub trait RegisteredService: Service {
    const KIND: ServiceKind;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
    Open,
    Committed,
    RolledBack,
}

pub struct Transaction {
    root: RootUrl,
    services: Vec<(ServiceKind, Box<dyn Service>)>,
    state: TxState,
    // Bound to the thread whose scan opened it.
    _not_send: PhantomData<*const ()>,
}

impl Transaction {
    /// Open a transaction for `root` on the current thread.
    ///
    /// # Panics
    ///
    /// Panics if another transaction is already open on this thread.
    pub fn begin(root: &RootUrl) -> Self {
        ACTIVE.with(|active| {
            assert!(
                !active.replace(true),
                "nested transaction opened for {root} on the same thread"
            );
        });
        tracing::trace!(target = "strata.index", root = %root, "transaction opened");
        Self {
            root: root.clone(),
            services: Vec::new(),
            state: TxState::Open,
            _not_send: PhantomData,
        }
    }

    pub fn root(&self) -> &RootUrl {
        &self.root
    }

    pub fn is_open(&self) -> bool {
        self.state == TxState::Open
    }

    pub fn kinds(&self) -> Vec<ServiceKind> {
        self.services.iter().map(|(kind, _)| *kind).collect()
    }

    pub fn register<S: RegisteredService>(&mut self, service: S) -> Result<(), TransactionError> {
        self.register_as(S::KIND, Box::new(service))
    }

    /// Register a service under an explicit kind, typically [`ServiceKind::Extension`].
    pub fn register_as(
        &mut self,
        kind: ServiceKind,
        service: Box<dyn Service>,
    ) -> Result<(), TransactionError> {
        if !self.is_open() {
            return Err(TransactionError::Finished);
        }
        if self.services.iter().any(|(existing, _)| *existing == kind) {
            return Err(TransactionError::DuplicateService { kind });
        }
        self.services.push((kind, service));
        Ok(())
    }

    pub fn get<S: RegisteredService>(&self) -> Result<&S, IndexError> {
        if !self.is_open() {
            return Err(TransactionError::Finished.into());
        }
        self.services
            .iter()
            .find(|(kind, _)| *kind == S::KIND)
            .and_then(|(_, service)| {
                let service: &dyn Any = service.as_ref();
                service.downcast_ref::<S>()
            })
            .ok_or(IndexError::MissingService { kind: S::KIND })
    }

    pub fn get_mut<S: RegisteredService>(&mut self) -> Result<&mut S, IndexError> {
        if !self.is_open() {
            return Err(TransactionError::Finished.into());
        }
        self.services
            .iter_mut()
            .find(|(kind, _)| *kind == S::KIND)
            .and_then(|(_, service)| {
                let service: &mut dyn Any = service.as_mut();
                service.downcast_mut::<S>()
            })
            .ok_or(IndexError::MissingService { kind: S::KIND })
    }

    /// Commit every service in registration order.
    ///
    /// All services are attempted; the first failure is returned after the rest ran.
    pub fn commit(&mut self) -> Result<(), TransactionError> {
        self.finish(Phase::Commit)
    }

    /// Roll back every service in registration order.
    pub fn roll_back(&mut self) -> Result<(), TransactionError> {
        self.finish(Phase::RollBack)
    }

    fn finish(&mut self, phase: Phase) -> Result<(), TransactionError> {
        if !self.is_open() {
            return Err(TransactionError::Finished);
        }
        self.state = match phase {
            Phase::Commit => TxState::Committed,
            Phase::RollBack => TxState::RolledBack,
        };
        ACTIVE.with(|active| active.set(false));

        let mut first_error = None;
        for (kind, service) in &mut self.services {
            let result = match phase {
                Phase::Commit => service.commit(),
                Phase::RollBack => service.roll_back(),
            };
            if let Err(err) = result {
                tracing::error!(
                    target = "strata.index",
                    root = %self.root,
                    service = %kind,
                    phase = %phase,
                    error = %err,
                    "transaction service failed"
                );
                first_error.get_or_insert(TransactionError::Service {
                    kind: *kind,
                    phase,
                    source: Box::new(err),
                });
            }
        }
        tracing::debug!(
            target = "strata.index",
            root = %self.root,
            phase = %phase,
            services = self.services.len(),
            ok = first_error.is_none(),
            "transaction finished"
        );
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.is_open() {
            tracing::debug!(
                target = "strata.index",
                root = %self.root,
                "rolling back abandoned transaction"
            );
            let _ = self.roll_back();
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("root", &self.root)
            .field("services", &self.kinds())
            .field("state", &self.state)
            .finish()
    }
}
