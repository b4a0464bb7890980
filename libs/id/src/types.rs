//! Typed ID definitions for the resources in a router sync response.

use crate::define_id;

// =============================================================================
// Routers and their sub-resources
// =============================================================================

define_id!(RouterId, "router");
define_id!(PortId, "port");
define_id!(FloatingIpId, "floating ip");

// =============================================================================
// Networks
// =============================================================================

define_id!(NetworkId, "network");
define_id!(SubnetId, "subnet");

// =============================================================================
// Hosting devices
// =============================================================================

define_id!(HostingDeviceId, "hosting device");
