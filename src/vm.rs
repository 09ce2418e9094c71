use std::cell::RefCell;
use std::io::{self, Write};
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, error, log_enabled, trace, Level};
use rustc_hash::FxHashMap;

use crate::chunk::Chunk;
use crate::compiler;
use crate::dis;
use crate::error::{ErrorBundle, LoxError};
use crate::value::{
    intern, BoundMethod, Closure, IStr, Instance, Native, NativeFn, Upvalue, Value,
};

const FRAMES_MAX: usize = 4096;
const STACK_MAX: usize = 1024;

/// One function invocation: the closure being run, its instruction pointer,
/// and the stack index of its slot 0 (the callee itself).
struct CallFrame {
    closure: Rc<Closure>,
    ip: usize,
    base: usize,
}

pub struct VM {
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: FxHashMap<IStr, Value>,
    /// Cells aliasing live stack slots, ordered by descending stack index.
    open_upvals: Vec<Rc<RefCell<Upvalue>>>,
    init_name: IStr,
    /// Sink for the `print` statement.
    out: Box<dyn Write>,
}

impl VM {
    pub fn new() -> Self {
        Self::with_output(Box::new(io::stdout()))
    }

    /// Builds a VM whose `print` statements write to `out` instead of stdout.
    pub fn with_output(out: Box<dyn Write>) -> Self {
        let mut vm = Self {
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::with_capacity(FRAMES_MAX),
            globals: FxHashMap::default(),
            open_upvals: vec![],
            init_name: intern("init"),
            out,
        };
        vm.define_natives();
        vm
    }

    /// Compiles and runs `src`, returning the script's result value.
    ///
    /// Globals survive across calls, so a REPL can keep feeding lines to one
    /// VM. A runtime error resets the stack and call frames before returning
    /// so the session stays usable.
    pub fn interpret(&mut self, src: &str, is_repl: bool) -> Result<Value, ErrorBundle> {
        let fun = compiler::compile(src, is_repl)?;
        let closure = Rc::new(Closure { fun: Rc::new(fun), upvals: vec![] });
        self.push(Value::Closure(closure.clone()));
        if let Err(err) = self.call_closure(closure, 0) {
            self.reset();
            return Err(err.into());
        }
        match self.run() {
            Ok(val) => Ok(val),
            Err(err) => {
                self.log_call_trace();
                self.reset();
                Err(err.into())
            }
        }
    }

    /// Line-oriented read-evaluate-print loop on stdin.
    pub fn repl(&mut self) {
        let stdin = io::stdin();
        let mut line = String::new();
        loop {
            line.clear();
            print!(">> ");
            let _ = io::stdout().flush();
            match stdin.read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            if line.trim().is_empty() {
                continue;
            }
            match self.interpret(&line, true) {
                Ok(val) => println!("<< {val}"),
                Err(err) => error!("{err}"),
            }
        }
    }

    fn reset(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvals.clear();
    }

    fn log_call_trace(&self) {
        for frame in self.frames.iter().rev() {
            let fun = &frame.closure.fun;
            let line = fun.chunk.lines.get(frame.ip.saturating_sub(1)).copied().unwrap_or(0);
            debug!("[L{line}] in {}", fun.name());
        }
    }

    /* Stack primitives */

    fn push(&mut self, v: Value) {
        self.stack.push(v);
    }

    fn pop(&mut self) -> Result<Value, LoxError> {
        match self.stack.pop() {
            Some(v) => Ok(v),
            None => self.rt_err("stack underflow"),
        }
    }

    fn peek(&self, dist: usize) -> &Value {
        &self.stack[self.stack.len() - 1 - dist]
    }

    /* Dispatch helpers */

    fn frame(&self) -> &CallFrame {
        self.frames.last().unwrap()
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().unwrap()
    }

    fn read_u8(&mut self) -> u8 {
        let frame = self.frame_mut();
        let b = frame.closure.fun.chunk.code[frame.ip];
        frame.ip += 1;
        b
    }

    fn read_u16(&mut self) -> u16 {
        let frame = self.frame_mut();
        let v = Chunk::read_u16(&frame.closure.fun.chunk.code, frame.ip);
        frame.ip += 2;
        v
    }

    fn read_const(&mut self) -> Value {
        let idx = self.read_u8() as usize;
        self.frame().closure.fun.chunk.consts[idx].clone()
    }

    fn read_str(&mut self) -> IStr {
        match self.read_const() {
            Value::Str(s) => s,
            _ => unreachable!("name constant must be a string"),
        }
    }

    /// Source line of the instruction currently being executed.
    fn line(&self) -> u32 {
        let Some(frame) = self.frames.last() else { return 0 };
        let i = frame.ip.saturating_sub(1);
        frame.closure.fun.chunk.lines.get(i).copied().unwrap_or(0)
    }

    fn rt_err<T>(&self, reason: impl Into<String>) -> Result<T, LoxError> {
        Err(LoxError::Runtime { line: self.line(), reason: reason.into() })
    }

    fn pop_num(&mut self, reason: &str) -> Result<f64, LoxError> {
        match self.pop()? {
            Value::Num(n) => Ok(n),
            _ => self.rt_err(reason),
        }
    }

    /* The dispatch loop */

    fn run(&mut self) -> Result<Value, LoxError> {
        use crate::opcode::OpCode::*;
        loop {
            if log_enabled!(Level::Trace) {
                trace!("{}", self.stack_dump());
                let frame = self.frame();
                let (inst, _) = dis::disassemble_inst(&frame.closure.fun.chunk, frame.ip);
                trace!("{inst}");
            }

            let byte = self.read_u8();
            let Some(op) = crate::opcode::OpCode::from_u8(byte) else {
                return self.rt_err(format!("unknown instruction '{byte}'"));
            };

            match op {
                Const => {
                    let v = self.read_const();
                    self.push(v);
                }
                Nil => self.push(Value::Nil),
                True => self.push(Value::Bool(true)),
                False => self.push(Value::Bool(false)),
                Pop => {
                    self.pop()?;
                }

                GetLocal => {
                    let slot = self.read_u8() as usize;
                    let at = self.frame().base + slot;
                    let v = self.stack[at].clone();
                    self.push(v);
                }
                SetLocal => {
                    let slot = self.read_u8() as usize;
                    let at = self.frame().base + slot;
                    let v = self.peek(0).clone();
                    self.stack[at] = v;
                }

                GetGlobal => {
                    let name = self.read_str();
                    match self.globals.get(&name) {
                        Some(v) => {
                            let v = v.clone();
                            self.push(v);
                        }
                        None => return self.rt_err(format!("undefined variable '{name}'")),
                    }
                }
                DefGlobal => {
                    let name = self.read_str();
                    let v = self.pop()?;
                    self.globals.insert(name, v);
                }
                SetGlobal => {
                    let name = self.read_str();
                    // Assigning to a never-defined global is an error, not an
                    // implicit definition.
                    if !self.globals.contains_key(&name) {
                        return self.rt_err(format!("undefined variable '{name}'"));
                    }
                    let v = self.peek(0).clone();
                    self.globals.insert(name, v);
                }

                GetUpval => {
                    let slot = self.read_u8() as usize;
                    let cell = self.frame().closure.upvals[slot].clone();
                    let v = match &*cell.borrow() {
                        Upvalue::Open(at) => self.stack[*at].clone(),
                        Upvalue::Closed(v) => v.clone(),
                    };
                    self.push(v);
                }
                SetUpval => {
                    let slot = self.read_u8() as usize;
                    let cell = self.frame().closure.upvals[slot].clone();
                    let v = self.peek(0).clone();
                    match &mut *cell.borrow_mut() {
                        Upvalue::Open(at) => self.stack[*at] = v,
                        Upvalue::Closed(old) => *old = v,
                    };
                }

                GetProp => {
                    let name = self.read_str();
                    let inst = match self.peek(0) {
                        Value::Instance(i) => i.clone(),
                        _ => return self.rt_err("only instances have properties"),
                    };
                    let field = inst.fields.borrow().get(&name).cloned();
                    let result = if let Some(v) = field {
                        v
                    } else if let Some(m) = inst.class.methods.borrow().get(&name).cloned() {
                        Value::BoundMethod(Rc::new(BoundMethod {
                            recv: self.peek(0).clone(),
                            method: m,
                        }))
                    } else {
                        return self.rt_err(format!("undefined property '{name}'"));
                    };
                    self.pop()?;
                    self.push(result);
                }
                SetProp => {
                    let name = self.read_str();
                    let inst = match self.peek(1) {
                        Value::Instance(i) => i.clone(),
                        _ => return self.rt_err("only instances have fields"),
                    };
                    // Assignment yields its RHS: the instance goes, the value stays.
                    let v = self.pop()?;
                    inst.fields.borrow_mut().insert(name, v.clone());
                    self.pop()?;
                    self.push(v);
                }

                Equal => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    self.push(Value::Bool(a == b));
                }
                Greater => {
                    let b = self.pop_num("operands must be numbers")?;
                    let a = self.pop_num("operands must be numbers")?;
                    self.push(Value::Bool(a > b));
                }
                Less => {
                    let b = self.pop_num("operands must be numbers")?;
                    let a = self.pop_num("operands must be numbers")?;
                    self.push(Value::Bool(a < b));
                }

                Not => {
                    let v = self.pop()?;
                    self.push(Value::Bool(v.is_falsey()));
                }
                Neg => {
                    let n = self.pop_num("operand must be a number")?;
                    self.push(Value::Num(-n));
                }

                Add => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    match (a, b) {
                        (Value::Num(x), Value::Num(y)) => self.push(Value::Num(x + y)),
                        (Value::Str(x), Value::Str(y)) => {
                            let cat = intern(&format!("{}{}", x.as_str(), y.as_str()));
                            self.push(Value::Str(cat));
                        }
                        _ => return self.rt_err("operands must be all numbers or all strings"),
                    }
                }
                Sub => {
                    let b = self.pop_num("operands must be numbers")?;
                    let a = self.pop_num("operands must be numbers")?;
                    self.push(Value::Num(a - b));
                }
                Mul => {
                    let b = self.pop_num("operands must be numbers")?;
                    let a = self.pop_num("operands must be numbers")?;
                    self.push(Value::Num(a * b));
                }
                Div => {
                    // IEEE semantics, so x/0 is an infinity or NaN, not an error.
                    let b = self.pop_num("operands must be numbers")?;
                    let a = self.pop_num("operands must be numbers")?;
                    self.push(Value::Num(a / b));
                }

                Print => {
                    let v = self.pop()?;
                    let _ = writeln!(self.out, "{}", v.print_string());
                }

                Jump => {
                    let off = self.read_u16() as usize;
                    self.frame_mut().ip += off;
                }
                JumpUnless => {
                    let off = self.read_u16() as usize;
                    if self.peek(0).is_falsey() {
                        self.frame_mut().ip += off;
                    }
                }
                Loop => {
                    let off = self.read_u16() as usize;
                    self.frame_mut().ip -= off;
                }

                Call => {
                    let argc = self.read_u8() as usize;
                    let callee = self.peek(argc).clone();
                    self.call_value(callee, argc)?;
                }
                Invoke => {
                    let name = self.read_str();
                    let argc = self.read_u8() as usize;
                    let inst = match self.peek(argc) {
                        Value::Instance(i) => i.clone(),
                        _ => return self.rt_err("only instances have properties"),
                    };
                    // A field shadows a method of the same name; only the
                    // method path skips the bound-method allocation, since
                    // the receiver is already sitting in slot 0.
                    let field = inst.fields.borrow().get(&name).cloned();
                    if let Some(callee) = field {
                        let slot = self.stack.len() - argc - 1;
                        self.stack[slot] = callee.clone();
                        self.call_value(callee, argc)?;
                    } else {
                        let method = inst.class.methods.borrow().get(&name).cloned();
                        match method {
                            Some(m) => self.call_closure(m, argc)?,
                            None => return self.rt_err(format!("undefined property '{name}'")),
                        }
                    }
                }

                Closure => {
                    let fun = match self.read_const() {
                        Value::Fun(f) => f,
                        _ => unreachable!("closure constant must be a function"),
                    };
                    let mut upvals = Vec::with_capacity(fun.upval_count);
                    for _ in 0..fun.upval_count {
                        let is_local = self.read_u8() == 1;
                        let idx = self.read_u8() as usize;
                        if is_local {
                            let at = self.frame().base + idx;
                            upvals.push(self.capture_upval(at));
                        } else {
                            upvals.push(self.frame().closure.upvals[idx].clone());
                        }
                    }
                    self.push(Value::Closure(Rc::new(crate::value::Closure { fun, upvals })));
                }
                CloseUpval => {
                    if !self.stack.is_empty() {
                        self.close_upvals(self.stack.len() - 1);
                    }
                    self.pop()?;
                }

                Class => {
                    let name = self.read_str();
                    self.push(Value::Class(Rc::new(crate::value::Class::new(name))));
                }
                Method => {
                    let name = self.read_str();
                    let method = match self.peek(0) {
                        Value::Closure(c) => c.clone(),
                        _ => unreachable!("method must be a closure"),
                    };
                    let class = match self.peek(1) {
                        Value::Class(c) => c.clone(),
                        _ => unreachable!("method target must be a class"),
                    };
                    class.methods.borrow_mut().insert(name, method);
                    self.pop()?;
                }

                Return => {
                    let res = self.pop()?;
                    let frame = self.frames.pop().unwrap();
                    self.close_upvals(frame.base);
                    self.stack.truncate(frame.base);
                    if self.frames.is_empty() {
                        return Ok(res);
                    }
                    self.push(res);
                }
            }
        }
    }

    /* Calling convention */

    fn call_value(&mut self, callee: Value, argc: usize) -> Result<(), LoxError> {
        match callee {
            Value::Class(class) => {
                let inst = Value::Instance(Rc::new(Instance::new(class.clone())));
                let slot = self.stack.len() - argc - 1;
                self.stack[slot] = inst;
                let init = class.methods.borrow().get(&self.init_name).cloned();
                match init {
                    Some(init) => self.call_closure(init, argc),
                    None if argc != 0 => {
                        self.rt_err(format!("expected 0 arguments but got {argc}"))
                    }
                    None => Ok(()),
                }
            }
            Value::BoundMethod(bm) => {
                // The receiver takes the callee slot, so the method body sees
                // it as `this` in slot 0.
                let slot = self.stack.len() - argc - 1;
                self.stack[slot] = bm.recv.clone();
                self.call_closure(bm.method.clone(), argc)
            }
            Value::Closure(closure) => self.call_closure(closure, argc),
            Value::Native(native) => {
                if argc != native.arity {
                    return self.rt_err(format!(
                        "expected {} arguments but got {argc}",
                        native.arity
                    ));
                }
                let base = self.stack.len() - argc;
                let res = (native.fun)(&self.stack[base..]);
                let res = res.map_err(|reason| LoxError::Runtime { line: self.line(), reason })?;
                self.stack.truncate(base - 1);
                self.push(res);
                Ok(())
            }
            _ => self.rt_err("can only call functions and classes"),
        }
    }

    fn call_closure(&mut self, closure: Rc<Closure>, argc: usize) -> Result<(), LoxError> {
        if argc != closure.fun.arity {
            return self.rt_err(format!(
                "expected {} arguments but got {argc}",
                closure.fun.arity
            ));
        }
        if self.frames.len() >= FRAMES_MAX {
            return self.rt_err("stack overflow");
        }
        let base = self.stack.len() - argc - 1;
        self.frames.push(CallFrame { closure, ip: 0, base });
        Ok(())
    }

    /* Upvalue protocol */

    /// Returns the open cell aliasing stack slot `at`, creating and inserting
    /// one if none exists. Every closure capturing the same slot therefore
    /// shares one cell.
    fn capture_upval(&mut self, at: usize) -> Rc<RefCell<Upvalue>> {
        let mut i = 0;
        while i < self.open_upvals.len() {
            let slot = match *self.open_upvals[i].borrow() {
                Upvalue::Open(slot) => slot,
                Upvalue::Closed(_) => unreachable!("closed cell on the open list"),
            };
            if slot == at {
                return self.open_upvals[i].clone();
            }
            if slot < at {
                break;
            }
            i += 1;
        }
        let cell = Rc::new(RefCell::new(Upvalue::Open(at)));
        self.open_upvals.insert(i, cell.clone());
        cell
    }

    /// Closes every open cell aliasing a stack slot at or above `min`: the
    /// slot's value moves into the cell, which then outlives the stack slot.
    fn close_upvals(&mut self, min: usize) {
        while let Some(cell) = self.open_upvals.first() {
            let at = match *cell.borrow() {
                Upvalue::Open(at) => at,
                Upvalue::Closed(_) => unreachable!("closed cell on the open list"),
            };
            if at < min {
                break;
            }
            let cell = self.open_upvals.remove(0);
            let v = self.stack[at].clone();
            *cell.borrow_mut() = Upvalue::Closed(v);
        }
    }

    /* Natives */

    fn define_native(&mut self, name: &'static str, arity: usize, fun: NativeFn) {
        let native = Value::Native(Rc::new(Native { name, arity, fun }));
        self.globals.insert(intern(name), native);
    }

    fn define_natives(&mut self) {
        self.define_native("clock", 0, |_args| {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_err(|e| e.to_string())?;
            Ok(Value::Num(now.as_secs_f64()))
        });
    }

    fn stack_dump(&self) -> String {
        let mut res = "          ".to_string();
        for slot in &self.stack {
            res.push_str(&format!("[ {slot} ]"));
        }
        res
    }
}

impl Default for VM {
    fn default() -> Self {
        Self::new()
    }
}
