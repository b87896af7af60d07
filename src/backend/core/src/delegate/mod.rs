//! Delegate invocation boundary and deployment contexts.

pub mod deployment;
pub mod invocation;

pub use deployment::{DeploymentHandle, DeploymentId, DeploymentRegistry};
pub use invocation::{
    ContextSwitchInterceptor, Delegate, DelegateInterceptor, DelegateInvocation, DelegateInvoker,
    DelegateRegistry, Next, TimingInterceptor,
};
