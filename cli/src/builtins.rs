//! Standard natives the CLI registers before running scripts: `print`,
//! `len` and `str`. Scripts reach them through `native("name")`.

use ecow::EcoString;
use tarn_core::value::{length, stringify};
use tarn_core::{Engine, ReplSession};

pub fn register(engine: &mut Engine) {
    engine.register_native("print", print);
    engine.register_native("len", len);
    engine.register_native("str", str_of);
}

pub fn register_repl(session: &mut ReplSession) {
    session.register_native("print", print);
    session.register_native("len", len);
    session.register_native("str", str_of);
}

fn print(
    heap: &mut tarn_core::Heap,
    args: &[tarn_core::ValueRef],
) -> Result<tarn_core::ValueRef, EcoString> {
    let rendered: Vec<String> = args.iter().map(|&arg| stringify(heap, arg)).collect();
    println!("{}", rendered.join(" "));
    Ok(heap.null())
}

fn len(
    heap: &mut tarn_core::Heap,
    args: &[tarn_core::ValueRef],
) -> Result<tarn_core::ValueRef, EcoString> {
    let [value] = args else {
        return Err("len takes exactly one argument".into());
    };
    match length(heap, *value) {
        Some(len) => Ok(heap.alloc_int(len as i64)),
        None => Err(EcoString::from(format!(
            "{} has no length",
            heap.get(*value).tag().name()
        ))),
    }
}

fn str_of(
    heap: &mut tarn_core::Heap,
    args: &[tarn_core::ValueRef],
) -> Result<tarn_core::ValueRef, EcoString> {
    let [value] = args else {
        return Err("str takes exactly one argument".into());
    };
    let text = stringify(heap, *value);
    Ok(heap.alloc_str(text))
}
