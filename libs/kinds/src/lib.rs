//! Managed resource kinds.
//!
//! Each kind pairs its desired/observed state types with an
//! [`ExternalClient`](xrm_reconcile::ExternalClient) over a narrow provider
//! API trait. The in-memory fakes of those APIs double as the development
//! runtime of the controller.
//!
//! ## Kinds
//!
//! - [`GroupPolicyAttachment`]: IAM policy attached to a group
//! - [`ElbAttachment`]: instance registered with a classic load balancer
//! - [`RouteTable`]: VPC route table with routes, subnet associations and tags

pub mod api;
pub mod ec2;
pub mod elb;
pub mod identity;

pub use api::{ApiError, ApiFactory};
pub use ec2::{FakeEc2, RouteTable, RouteTableClient, RouteTableParameters};
pub use elb::{ElbAttachment, ElbAttachmentClient, ElbAttachmentParameters, FakeElb};
pub use identity::{
    FakeIam, GroupPolicyAttachment, GroupPolicyAttachmentClient, GroupPolicyAttachmentParameters,
};
