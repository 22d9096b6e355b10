/*!
# Solharvest DevKit - stubs for testing without vendors or hardware

In-process stand-ins for everything the agent talks to:
- Time-series store stub recording line-protocol writes (with failure injection)
- Vendor REST API stub with canned JSON responses and request counting
- Web portal stub with cookie login and session-expiry injection
- Modbus TCP stub serving a configurable register bank
*/

pub mod api_stub;
pub mod modbus_stub;
pub mod portal_stub;
pub mod store_stub;

pub use api_stub::ApiStub;
pub use modbus_stub::ModbusStub;
pub use portal_stub::PortalStub;
pub use store_stub::StoreStub;
