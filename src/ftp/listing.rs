use chrono::{DateTime, Datelike, Local, Timelike};

use crate::vfs::{FileInfo, NodeKind};

/// Days after which the listing date switches from `Mon DD HH:MM` to
/// `Mon DD  YYYY`.
const RECENT_DAYS: i64 = 180;

/// Formats a directory entry the way `ls -l` does.
pub fn ls(info: &FileInfo) -> String {
    let type_char = match info.kind {
        NodeKind::Dir => 'd',
        NodeKind::File => '-',
    };
    let mtime = match info.mtime {
        Some(mtime) => ls_date(Local::now(), mtime),
        None => "Jan 02  0000".to_string(),
    };
    format!(
        "{}{}{}{}{}{}{}{}{}{} {:3} {:<8} {:<8} {:8} {} {}",
        type_char,
        flag(info.owner_readable, 'r'),
        flag(info.owner_writable, 'w'),
        flag(info.owner_executable, 'x'),
        flag(info.group_readable, 'r'),
        flag(info.group_writable, 'w'),
        flag(info.group_executable, 'x'),
        flag(info.other_readable, 'r'),
        flag(info.other_writable, 'w'),
        flag(info.other_executable, 'x'),
        info.nlinks,
        info.owner_name,
        info.group_name,
        info.size.unwrap_or(0),
        mtime,
        info.name,
    )
}

/// Emulates the `ls` date field and its two formats.
pub fn ls_date(now: DateTime<Local>, t: DateTime<Local>) -> String {
    if (now.date_naive() - t.date_naive()).num_days() > RECENT_DAYS {
        format!("{} {:02}  {}", month_name(t.month()), t.day(), t.year())
    } else {
        format!(
            "{} {:02} {:02}:{:02}",
            month_name(t.month()),
            t.day(),
            t.hour(),
            t.minute()
        )
    }
}

/// Matches the output of NT's ftp server in MSDOS mode.
pub fn msdos_longify(info: &FileInfo) -> String {
    let dir = match info.kind {
        NodeKind::Dir => "<DIR>",
        NodeKind::File => "     ",
    };
    let date = match info.mtime {
        Some(t) => msdos_date(t),
        None => "01-01-70 12:00AM".to_string(),
    };
    format!("{}       {} {:8} {}", date, dir, info.size.unwrap_or(0), info.name)
}

/// MS-DOS `dir` date, e.g. `09-19-95 05:33PM`.
fn msdos_date(t: DateTime<Local>) -> String {
    let (hour, am_pm) = if t.hour() == 0 {
        (12, "AM")
    } else if t.hour() < 12 {
        (t.hour(), "AM")
    } else if t.hour() == 12 {
        (12, "PM")
    } else {
        (t.hour() - 12, "PM")
    };
    format!(
        "{:02}-{:02}-{:02} {:02}:{:02}{}",
        t.month(),
        t.day(),
        t.year() % 100,
        hour,
        t.minute(),
        am_pm
    )
}

fn flag(set: bool, c: char) -> char {
    if set { c } else { '-' }
}

fn month_name(month: u32) -> &'static str {
    match month {
        1 => "Jan",
        2 => "Feb",
        3 => "Mar",
        4 => "Apr",
        5 => "May",
        6 => "Jun",
        7 => "Jul",
        8 => "Aug",
        9 => "Sep",
        10 => "Oct",
        11 => "Nov",
        _ => "Dec",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn info(kind: NodeKind, name: &str, size: u64) -> FileInfo {
        FileInfo {
            kind,
            name: name.to_string(),
            size: Some(size),
            mtime: Some(Local.with_ymd_and_hms(1995, 10, 19, 17, 33, 0).unwrap()),
            nlinks: 1,
            owner_name: "root".to_string(),
            group_name: "root".to_string(),
            owner_readable: true,
            owner_writable: true,
            owner_executable: false,
            group_readable: true,
            group_writable: false,
            group_executable: false,
            other_readable: false,
            other_writable: false,
            other_executable: false,
        }
    }

    #[test]
    fn long_listing_shape() {
        let line = ls(&info(NodeKind::File, "notes.txt", 1234));
        assert!(line.starts_with("-rw-r-----"), "got {:?}", line);
        assert!(line.contains("   1 root     root         1234 "));
        assert!(line.ends_with("notes.txt"));
        // Old file: year format.
        assert!(line.contains("Oct 19  1995"), "got {:?}", line);
    }

    #[test]
    fn directories_get_the_d_bit() {
        let mut i = info(NodeKind::Dir, "pub", 0);
        i.owner_executable = true;
        let line = ls(&i);
        assert!(line.starts_with("drwxr-----"), "got {:?}", line);
    }

    #[test]
    fn recent_files_show_the_clock() {
        let mut i = info(NodeKind::File, "x", 1);
        let recent = Local::now() - chrono::Duration::days(3);
        i.mtime = Some(recent);
        let line = ls(&i);
        assert!(
            line.contains(&format!("{:02}:{:02}", recent.hour(), recent.minute())),
            "got {:?}",
            line
        );
    }

    #[test]
    fn msdos_listing_shape() {
        let line = msdos_longify(&info(NodeKind::File, "a.txt", 77));
        assert!(line.starts_with("10-19-95 05:33PM"), "got {:?}", line);
        assert!(line.ends_with("77 a.txt"), "got {:?}", line);
        let dir = msdos_longify(&info(NodeKind::Dir, "sub", 0));
        assert!(dir.contains("<DIR>"));
    }
}
