//! Asynchronous CSV reader with batch interface
//!
//! Reads ledger commands from any `futures::io::AsyncRead` source in
//! fixed-size batches, for the concurrent strategy.
//!
//! # Architecture
//!
//! ```text
//! CSV Reader → AsyncReader → Batches of LedgerCommands
//!                  ↓
//!           csv_format module
//!           (CsvRecord, convert_csv_record)
//! ```

use crate::io::csv_format::{convert_csv_record, CsvRecord};
use crate::types::LedgerCommand;
use csv_async::AsyncReaderBuilder;
use futures::io::AsyncRead;
use futures::stream::StreamExt;
use tracing::warn;

/// Asynchronous CSV reader
///
/// Keeps one deserializer across batches so memory stays bounded by the
/// batch size.
pub struct AsyncReader<R: AsyncRead + Unpin> {
    csv_reader: csv_async::AsyncDeserializer<R>,
    line_num: usize,
}

impl<R: AsyncRead + Unpin + Send + 'static> AsyncReader<R> {
    pub fn new(reader: R) -> Self {
        let csv_reader = AsyncReaderBuilder::new()
            .flexible(true)
            .trim(csv_async::Trim::All)
            .create_deserializer(reader);

        Self {
            csv_reader,
            line_num: 0,
        }
    }

    /// Read a batch of ledger commands
    ///
    /// Reads up to `batch_size` rows. Rows that fail to parse are logged
    /// and skipped; they do not count toward the batch size.
    ///
    /// # Returns
    ///
    /// The converted commands in file order. An empty vector means the end
    /// of the input was reached.
    pub async fn read_batch(&mut self, batch_size: usize) -> Vec<LedgerCommand> {
        let mut batch = Vec::with_capacity(batch_size);
        let mut records = self.csv_reader.deserialize::<CsvRecord>();

        while batch.len() < batch_size {
            let Some(parsed) = records.next().await else {
                break;
            };
            self.line_num += 1;
            let line = self.line_num + 1;

            match parsed {
                Ok(csv_record) => match convert_csv_record(csv_record) {
                    Ok(command) => batch.push(command),
                    Err(error) => warn!(line, %error, "skipping invalid command"),
                },
                Err(error) => warn!(line, %error, "skipping unparsable row"),
            }
        }

        batch
    }
}
