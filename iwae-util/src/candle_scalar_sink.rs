use log::debug;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// A sink for named scalar metrics, e.g. `train/loss` at step 100
pub trait ScalarSink {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> anyhow::Result<()>;

    fn flush(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

///
/// Write `tag \t step \t value` lines; gzipped if the file name ends
/// with `.gz`
///
pub struct TsvScalarSink {
    writer: Box<dyn Write>,
}

impl TsvScalarSink {
    pub fn create(output_file: &str) -> anyhow::Result<Self> {
        let path = Path::new(output_file);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let file = File::create(path)?;
        let writer: Box<dyn Write> = match path.extension().and_then(|x| x.to_str()) {
            Some("gz") => Box::new(BufWriter::new(flate2::write::GzEncoder::new(
                file,
                flate2::Compression::default(),
            ))),
            _ => Box::new(BufWriter::new(file)),
        };
        let mut ret = Self { writer };
        writeln!(ret.writer, "tag\tstep\tvalue")?;
        Ok(ret)
    }
}

impl ScalarSink for TsvScalarSink {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> anyhow::Result<()> {
        writeln!(self.writer, "{}\t{}\t{}", tag, step, value)?;
        Ok(())
    }

    fn flush(&mut self) -> anyhow::Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

impl Drop for TsvScalarSink {
    fn drop(&mut self) {
        let _ = self.writer.flush();
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ScalarRecord {
    pub tag: Box<str>,
    pub value: f64,
    pub step: usize,
}

/// Keep every record in memory
#[derive(Default)]
pub struct MemoryScalarSink {
    pub records: Vec<ScalarRecord>,
}

impl MemoryScalarSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// values logged under `tag`, in order
    pub fn values(&self, tag: &str) -> Vec<f64> {
        self.records
            .iter()
            .filter(|r| r.tag.as_ref() == tag)
            .map(|r| r.value)
            .collect()
    }
}

impl ScalarSink for MemoryScalarSink {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> anyhow::Result<()> {
        self.records.push(ScalarRecord {
            tag: tag.into(),
            value,
            step,
        });
        Ok(())
    }
}

/// Send scalars to the `log` facade only
pub struct LogScalarSink;

impl ScalarSink for LogScalarSink {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> anyhow::Result<()> {
        debug!("[{}] {} = {}", step, tag, value);
        Ok(())
    }
}

/// Fan out to several sinks
#[derive(Default)]
pub struct TeeScalarSink {
    sinks: Vec<Box<dyn ScalarSink>>,
}

impl TeeScalarSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, sink: Box<dyn ScalarSink>) {
        self.sinks.push(sink);
    }
}

impl ScalarSink for TeeScalarSink {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> anyhow::Result<()> {
        for sink in self.sinks.iter_mut() {
            sink.add_scalar(tag, value, step)?;
        }
        Ok(())
    }

    fn flush(&mut self) -> anyhow::Result<()> {
        for sink in self.sinks.iter_mut() {
            sink.flush()?;
        }
        Ok(())
    }
}
