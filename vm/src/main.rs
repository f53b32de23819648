use clap::Parser as ClapParser;

use object::{IntObject, MethodCode, MethodFlags};
use vm::bootstrap::{self, ClassBuilder};
use vm::bridge::InvokeArg;
use vm::processor;

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Upper bound for the demonstration computations
    #[arg(short, default_value_t = 10)]
    n: i32,

    /// Log compilation and dispatch events
    #[arg(long)]
    trace: bool,
}

fn main() {
    let cli = Cli::parse();
    if cli.trace {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .init();
    }

    let machine = bootstrap::machine();
    let t = machine.make_thread(core::ptr::null_mut(), core::ptr::null_mut());

    // int add(int, int) { return a + b; }
    // int sum(int n)    { int acc = 0; for (int i = 1; i <= n; i++) acc += i; return acc; }
    // int fib(int n)    { return n < 2 ? n : fib(n - 1) + fib(n - 2); }
    let demo = ClassBuilder::new(&machine, "Demo")
        .extends(machine.specials.object)
        .method(
            "add",
            "(II)I",
            MethodFlags::STATIC,
            MethodCode::Bytecode(object::CodeRecord::new(
                vec![0x1A, 0x1B, 0x60, 0xAC],
                2,
            )),
        )
        .method(
            "sum",
            "(I)I",
            MethodFlags::STATIC,
            MethodCode::Bytecode(object::CodeRecord::new(
                vec![
                    0x03, 0x3C, 0x04, 0x3D, 0x1C, 0x1A, 0xA3, 0x00, 0x0D,
                    0x1B, 0x1C, 0x60, 0x3C, 0x84, 0x02, 0x01, 0xA7, 0xFF,
                    0xF4, 0x1B, 0xAC,
                ],
                3,
            )),
        )
        .method(
            "fib",
            "(I)I",
            MethodFlags::STATIC,
            MethodCode::Bytecode(object::CodeRecord::new(
                vec![
                    0x1A, 0x05, 0xA2, 0x00, 0x05, 0x1A, 0xAC, 0x1A, 0x04,
                    0x64, 0xB8, 0x00, 0x01, 0x1A, 0x05, 0x64, 0xB8, 0x00,
                    0x01, 0x60, 0xAC,
                ],
                1,
            )),
        )
        .build();

    // SAFETY: single-threaded demo over a freshly bootstrapped machine
    unsafe {
        let fib = object::Class::find_method(demo, "fib", "(I)I")
            .expect("fib method");
        bootstrap::pool_method(demo, fib);

        let args = [InvokeArg::Int(3), InvokeArg::Int(4)];
        print_result(
            "add(3, 4)",
            processor::invoke_list_by_name(t, demo, "add", "(II)I", core::ptr::null_mut(), &args),
        );

        let args = [InvokeArg::Int(cli.n)];
        print_result(
            &format!("sum(1..={})", cli.n),
            processor::invoke_list_by_name(t, demo, "sum", "(I)I", core::ptr::null_mut(), &args),
        );
        print_result(
            &format!("fib({})", cli.n),
            processor::invoke_list_by_name(t, demo, "fib", "(I)I", core::ptr::null_mut(), &args),
        );
    }
}

fn print_result(label: &str, result: Option<*mut object::Object>) {
    match result {
        // SAFETY: the demo methods all return boxed ints
        Some(obj) => unsafe {
            println!("{label} = {}", (*(obj as *mut IntObject)).value)
        },
        None => eprintln!("{label} raised an exception"),
    }
}
