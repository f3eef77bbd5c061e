/*! Local IPC layer of the setsuna runtime.
 *
 * Three pieces: the wire [`protocol`] (command tags, status taxonomy, POD
 * payloads), the [`channel`] transport (length-prefixed records over a unix
 * stream socket with out-of-band fd passing), and the [`shmem`] device
 * snapshot shared between the server and every client. The [`client`] module
 * is the connector applications link against.
 */

pub mod channel;
pub mod client;
pub mod protocol;
pub mod shmem;
