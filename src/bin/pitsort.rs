#[macro_use]
extern crate clap;

use std::fs;
use std::io::{self, Write};
use std::mem;
use std::process;
use std::time;

use byteorder::{NativeEndian, WriteBytesExt};
use libc::{getrusage, rusage, RUSAGE_SELF};
use pitsort::{forward_bwt, make_suffix_array, reverse_bwt};

fn main() {
    let matches = clap_app!(pitsort =>
        (about: "parallel ITS suffix sorting and BWT test driver")
        (@arg THREADS: -j --threads +takes_value "number of worker threads")
        (@arg TIMES: -t --times +takes_value "repeat multiple times")
        (@arg CHECK: -c --check "check the suffix array")
        (@arg BWT: -b --bwt "run a forward+reverse BWT round trip instead")
        (@arg OUTPUT: -o --output +takes_value "write the suffix array to a file")
        (@arg INPUT: +required "the data to sort")
    )
    .get_matches();

    let input_file = matches.value_of("INPUT").unwrap();
    let check_suffix_array = matches.is_present("CHECK");
    let run_bwt = matches.is_present("BWT");
    let threads = matches
        .value_of("THREADS")
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1);
    let repeat_times = Ord::max(
        matches
            .value_of("TIMES")
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(1),
        1,
    );

    let text = match fs::read(&input_file) {
        Ok(text) => text,
        Err(err) => {
            eprintln!("error: {:?}", err);
            process::exit(1);
        }
    };
    eprintln!("load {} bytes from `{}`", text.len(), &input_file);

    if run_bwt {
        let mut times = String::new();
        for _ in 0..repeat_times {
            let mut data = text.clone();
            let ((), dur) = timeit(|| {
                let sentinel = forward_bwt(&mut data[..], threads).unwrap();
                reverse_bwt(&mut data[..], sentinel, threads).unwrap();
            });
            times.push_str(format!("{:.3}s ", dur.as_secs_f64()).as_str());
            if data != text {
                eprintln!("error: BWT round trip does not reproduce the input");
                process::exit(1);
            }
        }
        eprintln!(" time: {}", times);
        eprintln!("  rss: {:.3}MiB", get_peak_rss_kib() as f64 / 1024.0);
        return;
    }

    let mut suf = Vec::new();
    let mut times = String::new();
    for _ in 0..repeat_times {
        let (result, dur) = timeit(|| make_suffix_array(&text[..], threads).unwrap());
        suf = result;
        times.push_str(format!("{:.3}s ", dur.as_secs_f64()).as_str());
    }
    eprintln!(" time: {}", times);
    eprintln!("  rss: {:.3}MiB", get_peak_rss_kib() as f64 / 1024.0);
    if check_suffix_array {
        eprintln!("check: {}", check(&text[..], &suf[..]));
    }

    if let Some(outname) = matches.value_of("OUTPUT") {
        let file = match fs::File::create(outname) {
            Ok(file) => file,
            Err(err) => {
                eprintln!("error: {:?}", err);
                process::exit(1);
            }
        };
        let mut file = io::BufWriter::new(file);
        suf.iter()
            .cloned()
            .for_each(|x| file.write_u32::<NativeEndian>(x).unwrap());
        file.flush().unwrap();
        eprintln!("store file `{}` of {} bytes", outname, 4 * suf.len());
    }
}

fn timeit<F, T>(f: F) -> (T, time::Duration)
where
    F: FnOnce() -> T,
{
    let start = time::Instant::now();
    let ret = f();
    let dur = start.elapsed();
    (ret, dur)
}

fn get_peak_rss_kib() -> u64 {
    let mut ru;
    unsafe {
        ru = mem::zeroed::<rusage>();
        getrusage(RUSAGE_SELF, &mut ru as *mut rusage);
    }
    ru.ru_maxrss as u64
}

fn check(text: &[u8], suf: &[u32]) -> bool {
    if suf.len() != text.len() + 1 || suf[0] as usize != text.len() {
        return false;
    }
    for i in 2..suf.len() {
        if text[suf[i - 1] as usize..] >= text[suf[i] as usize..] {
            return false;
        }
    }
    true
}
