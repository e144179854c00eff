use super::crypto::sha256_hex;
use super::transaction::Transaction;

/// Merkle root of an empty transaction list
pub const EMPTY_MERKLE_ROOT: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// Computes the Merkle root over an ordered transaction list
///
/// Leaves are `sha256(transaction_data)`. Each layer hashes neighbours
/// left-to-right, duplicating the last node when the layer is odd, until a
/// single node is left. A single transaction yields its leaf hash unchanged
/// and an empty list yields [`EMPTY_MERKLE_ROOT`].
pub fn merkle_root(transactions: &[Transaction]) -> String {
    let mut layer: Vec<String> = transactions
        .iter()
        .map(|tx| sha256_hex(&tx.transaction_data()))
        .collect();

    if layer.is_empty() {
        return EMPTY_MERKLE_ROOT.to_string();
    }

    while layer.len() > 1 {
        if layer.len() % 2 != 0 {
            if let Some(last) = layer.last().cloned() {
                layer.push(last);
            }
        }

        layer = layer
            .chunks(2)
            .map(|pair| sha256_hex(&format!("{}{}", pair[0], pair[1])))
            .collect();
    }

    layer.swap_remove(0)
}
