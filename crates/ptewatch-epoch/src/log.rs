use std::io::Write;

use ptewatch_core::AccessedPage;

/// Persistent record of sampled epochs.
///
/// One line per accessed page:
///
/// ```text
/// <elapsed_us>,<epoch>,0x<va>[,0x<pfn>,<mapping>]
/// ```
///
/// The frame and mapping columns are written only for pages that carry
/// them. Every epoch is flushed as a whole.
pub struct EpochLog<W>
where
    W: Write,
{
    writer: W,
    epochs: u64,
    pages: u64,
}

impl<W> EpochLog<W>
where
    W: Write,
{
    /// Creates a new log writing to `writer`.
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            epochs: 0,
            pages: 0,
        }
    }

    /// Returns the number of epochs recorded.
    pub fn epochs(&self) -> u64 {
        self.epochs
    }

    /// Returns the number of pages recorded.
    pub fn pages(&self) -> u64 {
        self.pages
    }

    /// Returns the underlying writer.
    pub fn into_inner(self) -> W {
        self.writer
    }

    /// Appends one sampled epoch and flushes it.
    pub fn record(
        &mut self,
        epoch: u64,
        elapsed_us: u128,
        pages: &[AccessedPage],
    ) -> std::io::Result<()> {
        for page in pages {
            write!(self.writer, "{elapsed_us},{epoch},0x{:x}", page.va)?;

            if let (Some(frame), Some(mapping)) = (page.frame, &page.mapping) {
                write!(self.writer, ",0x{frame:x},{mapping}")?;
            }

            writeln!(self.writer)?;
        }

        self.writer.flush()?;

        self.epochs += 1;
        self.pages += pages.len() as u64;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use ptewatch_core::{Pfn, Va};

    use super::*;

    #[test]
    fn writes_one_line_per_page() {
        let mut log = EpochLog::new(Vec::new());

        log.record(
            3,
            1250,
            &[
                AccessedPage::new(Va(0x7f00_0000_1000)),
                AccessedPage::new(Va(0x7f00_0000_3000))
                    .with_frame(Pfn(0x1a2b), Arc::from("[heap]")),
            ],
        )
        .unwrap();
        log.record(4, 2500, &[]).unwrap();

        assert_eq!(log.epochs(), 2);
        assert_eq!(log.pages(), 2);
        assert_eq!(
            String::from_utf8(log.into_inner()).unwrap(),
            "1250,3,0x7f0000001000\n1250,3,0x7f0000003000,0x1a2b,[heap]\n"
        );
    }
}
