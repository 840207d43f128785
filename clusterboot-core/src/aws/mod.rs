//! AWS access over plain HTTP
//!
//! Request signing, credentials and the instance metadata client shared by
//! the message channel and fleet directory implementations.

pub mod client;
pub mod credentials;
pub mod metadata;
pub mod sigv4;

pub use client::{AwsResponse, AwsService, HttpConfig, ServiceClient};
pub use credentials::{
    default_provider, Credentials, CredentialsProvider, InstanceRoleCredentials, RoleCredentials,
    StaticCredentials,
};
pub use metadata::{InstanceMetadataClient, MetadataConfig};
