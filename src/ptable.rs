use crate::runner::Runner;
use anyhow::{bail, Context, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct Partition {
    pub device: String,
    pub start: u64,
    pub size: u64,
    /// Opaque token: hex for MBR, a GUID for GPT. Preserved verbatim.
    pub type_code: String,
}

impl Partition {
    pub fn end(&self) -> u64 {
        self.start + self.size
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PartitionTable {
    pub label: String,
    pub label_id: Option<String>,
    pub device: String,
    pub unit: String,
    /// In partition-table order, not sorted by start sector.
    pub partitions: Vec<Partition>,
}

impl PartitionTable {
    /// Parse an sfdisk dump: `key: value` header lines and
    /// `DEV : start=N, size=N, type=T` partition rows. Only the four named
    /// header keys survive a round trip.
    pub fn parse(text: &str) -> Result<Self> {
        let mut label = None;
        let mut label_id = None;
        let mut device = None;
        let mut unit = None;
        let mut partitions = Vec::new();

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            if let Some(part) = parse_partition_line(line)? {
                partitions.push(part);
                continue;
            }

            if let Some((key, value)) = line.split_once(':') {
                let value = value.trim().to_string();
                match key.trim() {
                    "label" => label = Some(value),
                    "label-id" => label_id = Some(value),
                    "device" => device = Some(value),
                    "unit" => unit = Some(value),
                    _ => {} // sector-size, first-lba, ... are not preserved
                }
            }
        }

        let label = label.context("partition dump has no label")?;
        if label != "dos" && label != "gpt" {
            bail!("unsupported partition table label '{}'", label);
        }
        let unit = unit.context("partition dump has no unit")?;
        if unit != "sectors" {
            bail!("partition dump unit is '{}', expected sectors", unit);
        }
        let device = device.context("partition dump has no device")?;

        Ok(Self {
            label,
            label_id,
            device,
            unit,
            partitions,
        })
    }

    /// Render the dump with the preserved header keys in order, a blank
    /// line, then fixed-width partition rows.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("label: {}\n", self.label));
        if let Some(id) = &self.label_id {
            out.push_str(&format!("label-id: {}\n", id));
        }
        out.push_str(&format!("device: {}\n", self.device));
        out.push_str(&format!("unit: {}\n", self.unit));
        out.push('\n');
        for p in &self.partitions {
            out.push_str(&format!(
                "{} : start={:>12}, size={:>12}, type={}\n",
                p.device, p.start, p.size, p.type_code
            ));
        }
        out
    }

    /// End of the last partition in table order, in sectors. This is the
    /// minimum image length.
    pub fn end_sector(&self) -> Result<u64> {
        self.partitions
            .last()
            .map(Partition::end)
            .context("partition table is empty")
    }

    /// A copy of the table with the root (second) partition resized.
    ///
    /// Resizing is only supported for the two-partition boot/root layout,
    /// so the root is always the second entry.
    pub fn resize_root(&self, new_sectors: u64) -> Result<Self> {
        if self.partitions.len() < 2 {
            bail!(
                "cannot resize root: table has {} partition(s)",
                self.partitions.len()
            );
        }
        let mut table = self.clone();
        table.partitions[1].size = new_sectors;
        Ok(table)
    }
}

fn parse_partition_line(line: &str) -> Result<Option<Partition>> {
    let Some((device, attrs)) = line.split_once(" : ") else {
        return Ok(None);
    };

    let mut start = None;
    let mut size = None;
    let mut type_code = None;
    for attr in attrs.split(',') {
        let Some((key, value)) = attr.split_once('=') else {
            continue; // bare flags like "bootable"
        };
        let value = value.trim();
        match key.trim() {
            "start" => start = Some(value.parse::<u64>().context("bad start sector")?),
            "size" => size = Some(value.parse::<u64>().context("bad size")?),
            "type" => type_code = Some(value.to_string()),
            _ => {} // uuid, name, attrs are not preserved
        }
    }

    let (Some(start), Some(size), Some(type_code)) = (start, size, type_code) else {
        return Ok(None);
    };

    // Empty slots and extended-table placeholders are not real partitions.
    if size == 0 || type_code == "0" {
        return Ok(None);
    }
    if start == 0 {
        bail!("partition {} starts at sector 0", device);
    }

    Ok(Some(Partition {
        device: device.trim().to_string(),
        start,
        size,
        type_code,
    }))
}

/// Read the partition table of a device (or image file).
pub fn read_device(runner: &dyn Runner, device: &str) -> Result<PartitionTable> {
    let out = runner
        .run_capture("sfdisk", &["--dump", device])
        .with_context(|| format!("dumping the partition table of {}", device))?;
    PartitionTable::parse(&out).with_context(|| format!("parsing the partition table of {}", device))
}

/// Write a partition table into an already-allocated image file.
pub fn write_image(runner: &dyn Runner, image: &str, table: &PartitionTable) -> Result<()> {
    runner
        .run_with_input("sfdisk", &["--quiet", image], &table.render())
        .with_context(|| format!("writing the partition table to {}", image))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOS_DUMP: &str = "\
label: dos
label-id: 0x21c8a1e6
device: /dev/mmcblk0
unit: sectors
sector-size: 512

/dev/mmcblk0p1 : start=        8192, size=      524288, type=c
/dev/mmcblk0p2 : start=      532480, size=    15000000, type=83
";

    #[test]
    fn parses_dos_dump() {
        let table = PartitionTable::parse(DOS_DUMP).unwrap();
        assert_eq!(table.label, "dos");
        assert_eq!(table.label_id.as_deref(), Some("0x21c8a1e6"));
        assert_eq!(table.device, "/dev/mmcblk0");
        assert_eq!(table.partitions.len(), 2);
        assert_eq!(table.partitions[0].start, 8192);
        assert_eq!(table.partitions[0].size, 524288);
        assert_eq!(table.partitions[0].type_code, "c");
        assert_eq!(table.partitions[1].type_code, "83");
        assert_eq!(table.end_sector().unwrap(), 532480 + 15000000);
    }

    #[test]
    fn parses_gpt_dump_preserving_guid_type() {
        let dump = "\
label: gpt
label-id: 0FC63DAF-3B71-44FD-B3BF-9E79B9B34A01
device: /dev/sda
unit: sectors
first-lba: 34
last-lba: 31116254

/dev/sda1 : start=        2048, size=     1048576, type=C12A7328-F81F-11D2-BA4B-00A0C93EC93B, uuid=AA11BB22
/dev/sda2 : start=     1050624, size=    30063616, type=0FC63DAF-8483-4772-8E79-3D69D8477DE4
";
        let table = PartitionTable::parse(dump).unwrap();
        assert_eq!(table.label, "gpt");
        assert_eq!(
            table.partitions[0].type_code,
            "C12A7328-F81F-11D2-BA4B-00A0C93EC93B"
        );
    }

    #[test]
    fn skips_empty_and_type_zero_partitions() {
        let dump = "\
label: dos
label-id: 0xdeadbeef
device: /dev/sdc
unit: sectors

/dev/sdc1 : start=        2048, size=      100000, type=83
/dev/sdc2 : start=      102048, size=           0, type=83
/dev/sdc3 : start=      202048, size=      100000, type=0
";
        let table = PartitionTable::parse(dump).unwrap();
        assert_eq!(table.partitions.len(), 1);
        assert_eq!(table.partitions[0].device, "/dev/sdc1");
    }

    #[test]
    fn render_parse_round_trips() {
        let table = PartitionTable::parse(DOS_DUMP).unwrap();
        let rendered = table.render();
        let reparsed = PartitionTable::parse(&rendered).unwrap();
        assert_eq!(table, reparsed);
    }

    #[test]
    fn resize_root_replaces_second_partition_only() {
        let table = PartitionTable::parse(DOS_DUMP).unwrap();
        let resized = table.resize_root(5000000).unwrap();
        assert_eq!(resized.partitions[0].size, 524288);
        assert_eq!(resized.partitions[1].size, 5000000);
        assert_eq!(resized.partitions[1].start, 532480);
        // The original is untouched.
        assert_eq!(table.partitions[1].size, 15000000);
    }

    #[test]
    fn resize_root_needs_two_partitions() {
        let dump = "\
label: dos
device: /dev/sdd
unit: sectors

/dev/sdd1 : start=        2048, size=      100000, type=83
";
        let table = PartitionTable::parse(dump).unwrap();
        assert!(table.resize_root(1).is_err());
    }

    #[test]
    fn rejects_wrong_unit() {
        let dump = "label: dos\ndevice: /dev/sda\nunit: cylinders\n";
        assert!(PartitionTable::parse(dump).is_err());
    }
}
