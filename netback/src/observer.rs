// SPDX-License-Identifier: Apache-2.0

use crate::netif::InterfaceId;

/// Lifecycle callbacks for components that shadow interfaces, such as a NIC
/// offload driver. Callbacks run on the thread changing the interface state
/// and must not call back into the backend.
pub trait InterfaceObserver: Send + Sync {
    /// The interface was assigned to `partition` and can carry traffic.
    fn interface_up(&self, _id: InterfaceId, _partition: usize) {}

    fn interface_down(&self, _id: InterfaceId) {}

    /// Every reference is gone; the interface will not come back.
    fn interface_teardown(&self, _id: InterfaceId) {}
}
