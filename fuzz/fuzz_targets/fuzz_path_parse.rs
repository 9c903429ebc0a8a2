#![no_main]
use libfuzzer_sys::fuzz_target;
use wirefs::core::path::FsPath;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(path) = FsPath::parse(text) {
        // A parsed path prints back to a form that parses to itself.
        let printed = path.to_string();
        let again = FsPath::parse(&printed).expect("printed path parses");
        assert_eq!(again, path);
    }
});
