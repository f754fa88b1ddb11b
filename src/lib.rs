// Per-node runtime for a fixed-topology distributed computation. Each node
// runs one dispatcher task that owns all protocol state: the vector clock,
// the snapshot round bookkeeping and the converge-cast aggregation. Neighbor
// links are read by dedicated receiver tasks which only ever hand decoded
// messages to the dispatcher, so no protocol state is shared behind a lock.
//
// The coordinator (node 0) periodically floods markers to take a
// Chandy-Lamport snapshot, collects every node's recorded clock up the
// spanning tree the markers discover, checks the result for consistency and
// decides whether the whole computation has terminated.

pub mod service;
