use std::ptr::null_mut;

use crate::call_frame::CallFrame;
use crate::chunk::OpCode;
use crate::compiler::Parser;
use crate::constants::{FRAMES_MAX, STACK_MAX};
use crate::objects::{
    object::{Object, ObjectType},
    object_bound_method::ObjectBoundMethod,
    object_class::ObjectClass,
    object_closure::ObjectClosure,
    object_function::ObjectFunction,
    object_instance::ObjectInstance,
    object_manager::ObjectManager,
    object_native_function::{NativeObject, ObjectNativeFunction},
    object_string::{hash_string, ObjectString},
    object_upvalue::ObjectUpvalue,
};
use crate::std_mod::time::ClockTime;
use crate::table::Table;
use crate::value::{format_value, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpretResult {
    InterpretOk,
    InterpretCompileError,
    InterpretRuntimeError,
}

/// The whole interpreter: value stack, call frames, globals, the string
/// intern table and the object heap. Owns every root the collector scans.
pub struct Vm {
    pub(crate) stack: Box<[Value]>,
    pub(crate) stack_top: usize,
    pub(crate) frames: Vec<CallFrame>,
    pub(crate) globals: Table,
    pub(crate) strings: Table,
    pub(crate) open_upvalues: *mut ObjectUpvalue,
    pub(crate) init_string: *mut ObjectString,
    pub(crate) compiler_roots: Vec<*mut ObjectFunction>,
    pub(crate) heap: ObjectManager,
}

impl Vm {
    pub fn new() -> Vm {
        let mut vm = Vm {
            stack: vec![Value::Nil; STACK_MAX].into_boxed_slice(),
            stack_top: 0,
            frames: Vec::with_capacity(FRAMES_MAX),
            globals: Table::new(),
            strings: Table::new(),
            open_upvalues: null_mut(),
            init_string: null_mut(),
            compiler_roots: Vec::new(),
            heap: ObjectManager::new(),
        };
        vm.init_string = vm.copy_string("init");
        vm.define_native("clock", 0, Box::new(ClockTime::new()));
        vm
    }

    pub fn interpret(&mut self, source: &str) -> InterpretResult {
        let function = match self.compile(source) {
            Some(function) => function,
            None => return InterpretResult::InterpretCompileError,
        };

        self.push(Value::Obj(function as *mut Object));
        let closure = self.allocate_closure(function);
        self.pop();
        self.push(Value::Obj(closure as *mut Object));
        if let Err(message) = self.call(closure, 0) {
            self.runtime_error(&message);
            return InterpretResult::InterpretRuntimeError;
        }

        match self.run() {
            Ok(()) => InterpretResult::InterpretOk,
            Err(message) => {
                self.runtime_error(&message);
                InterpretResult::InterpretRuntimeError
            }
        }
    }

    fn compile(&mut self, source: &str) -> Option<*mut ObjectFunction> {
        let parser = Parser::new(self, source);
        parser.compile()
    }

    pub fn push(&mut self, value: Value) {
        self.stack[self.stack_top] = value;
        self.stack_top += 1;
    }

    pub fn pop(&mut self) -> Value {
        self.stack_top -= 1;
        self.stack[self.stack_top]
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack_top - 1 - distance]
    }

    #[inline(always)]
    fn frame(&self) -> &CallFrame {
        let index = self.frames.len() - 1;
        &self.frames[index]
    }

    #[inline(always)]
    fn frame_mut(&mut self) -> &mut CallFrame {
        let index = self.frames.len() - 1;
        &mut self.frames[index]
    }

    /// Register a global native. Name and function are parked on the stack
    /// while the other is allocated, so neither can be collected early.
    pub fn define_native(&mut self, name: &str, arity: u8, native: Box<dyn NativeObject>) {
        let name_string = self.copy_string(name);
        self.push(Value::Obj(name_string as *mut Object));
        let native_object = self.allocate_native(name.to_string(), arity, native);
        self.push(Value::Obj(native_object as *mut Object));
        self.globals.set(name_string, self.stack[self.stack_top - 1]);
        self.pop();
        self.pop();
    }

    /// Embedding helper: read a global by source-level name.
    pub fn get_global(&self, name: &str) -> Option<Value> {
        let key = self.globals.find_string(name, hash_string(name))?;
        self.globals.get(key)
    }

    /// Collect before every allocation, regardless of the byte threshold.
    pub fn set_gc_stress(&mut self, stress: bool) {
        self.heap.stress = stress;
    }

    fn maybe_collect(&mut self) {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
    }

    // Every object allocation funnels through one of these wrappers; the
    // collection point sits before the allocation so the new object is never
    // swept by the cycle it triggered.

    pub(crate) fn copy_string(&mut self, content: &str) -> *mut ObjectString {
        let hash = hash_string(content);
        if let Some(interned) = self.strings.find_string(content, hash) {
            return interned;
        }
        self.intern_new_string(content.to_string())
    }

    pub(crate) fn take_string(&mut self, content: String) -> *mut ObjectString {
        let hash = hash_string(&content);
        if let Some(interned) = self.strings.find_string(&content, hash) {
            return interned;
        }
        self.intern_new_string(content)
    }

    fn intern_new_string(&mut self, content: String) -> *mut ObjectString {
        self.maybe_collect();
        let string = self.heap.alloc_string(content);
        // Keep the new string reachable while the intern table grows.
        self.push(Value::Obj(string as *mut Object));
        self.strings.set(string, Value::Nil);
        self.pop();
        string
    }

    pub(crate) fn allocate_function(&mut self, name: String) -> *mut ObjectFunction {
        self.maybe_collect();
        self.heap.alloc_function(name)
    }

    pub(crate) fn allocate_closure(&mut self, function: *mut ObjectFunction) -> *mut ObjectClosure {
        self.maybe_collect();
        self.heap.alloc_closure(function)
    }

    fn allocate_native(
        &mut self,
        name: String,
        arity: u8,
        native: Box<dyn NativeObject>,
    ) -> *mut ObjectNativeFunction {
        self.maybe_collect();
        self.heap.alloc_native(name, arity, native)
    }

    fn allocate_upvalue(&mut self, location: *mut Value) -> *mut ObjectUpvalue {
        self.maybe_collect();
        self.heap.alloc_upvalue(location)
    }

    fn allocate_class(&mut self, name: String) -> *mut ObjectClass {
        self.maybe_collect();
        self.heap.alloc_class(name)
    }

    fn allocate_instance(&mut self, class: *mut ObjectClass) -> *mut ObjectInstance {
        self.maybe_collect();
        self.heap.alloc_instance(class)
    }

    fn allocate_bound_method(
        &mut self,
        receiver: Value,
        method: *mut ObjectClosure,
    ) -> *mut ObjectBoundMethod {
        self.maybe_collect();
        self.heap.alloc_bound_method(receiver, method)
    }

    fn reset_stack(&mut self) {
        self.stack_top = 0;
        self.frames.clear();
        self.open_upvalues = null_mut();
    }

    /// Report a runtime error with a stack trace, innermost frame first,
    /// then drop all execution state so a REPL can carry on.
    fn runtime_error(&mut self, message: &str) {
        eprintln!("{}", message);
        for frame in self.frames.iter().rev() {
            let function = frame.function();
            let instruction = frame.ip.saturating_sub(1);
            let line = function.chunk.lines[instruction];
            if function.name.is_empty() {
                eprintln!("[line {}] in script", line);
            } else {
                eprintln!("[line {}] in {}()", line, function.name);
            }
        }
        self.reset_stack();
    }

    fn call_value(&mut self, callee: Value, arg_count: usize) -> Result<(), String> {
        if let Value::Obj(object) = callee {
            match unsafe { (*object).obj_type } {
                ObjectType::ObjClosure => {
                    return self.call(object as *mut ObjectClosure, arg_count)
                }
                ObjectType::ObjNativeFunction => {
                    return self.call_native(object as *mut ObjectNativeFunction, arg_count)
                }
                ObjectType::ObjClass => return self.call_class(object as *mut ObjectClass, arg_count),
                ObjectType::ObjBoundMethod => {
                    let bound = unsafe { &*(object as *mut ObjectBoundMethod) };
                    self.stack[self.stack_top - arg_count - 1] = bound.receiver;
                    return self.call(bound.method, arg_count);
                }
                _ => {}
            }
        }
        Err("Can only call functions and classes.".to_string())
    }

    fn call(&mut self, closure: *mut ObjectClosure, arg_count: usize) -> Result<(), String> {
        let function = unsafe { &*(*closure).function };
        if arg_count != function.arity as usize {
            return Err(format!(
                "Expected {} arguments but got {}.",
                function.arity, arg_count
            ));
        }
        if self.frames.len() == FRAMES_MAX {
            return Err("Stack overflow.".to_string());
        }
        let slots = self.stack_top - arg_count - 1;
        self.frames.push(CallFrame::new(closure, slots));
        Ok(())
    }

    fn call_native(
        &mut self,
        native: *mut ObjectNativeFunction,
        arg_count: usize,
    ) -> Result<(), String> {
        let native_ref = unsafe { &*native };
        if arg_count != native_ref.arity as usize {
            return Err(format!(
                "Expected {} arguments but got {}.",
                native_ref.arity, arg_count
            ));
        }
        let args_start = self.stack_top - arg_count;
        let result = native_ref.native.call(&self.stack[args_start..self.stack_top])?;
        self.stack_top -= arg_count + 1;
        self.push(result);
        Ok(())
    }

    /// Calling a class constructs an instance; the class's `init` closure,
    /// if any, runs on top of it with the same arguments.
    fn call_class(&mut self, class: *mut ObjectClass, arg_count: usize) -> Result<(), String> {
        let instance = self.allocate_instance(class);
        self.stack[self.stack_top - arg_count - 1] = Value::Obj(instance as *mut Object);
        let initializer = unsafe { (*class).methods.get(self.init_string) };
        if let Some(Value::Obj(init)) = initializer {
            return self.call(init as *mut ObjectClosure, arg_count);
        }
        if arg_count != 0 {
            return Err(format!("Expected 0 arguments but got {}.", arg_count));
        }
        Ok(())
    }

    fn invoke(&mut self, name: *mut ObjectString, arg_count: usize) -> Result<(), String> {
        let receiver = self.peek(arg_count);
        let instance = match receiver {
            Value::Obj(object)
                if unsafe { (*object).obj_type } == ObjectType::ObjInstance =>
            {
                object as *mut ObjectInstance
            }
            _ => return Err("Only instances have methods.".to_string()),
        };

        // A field holding a callable shadows any method of the same name.
        if let Some(field) = unsafe { (*instance).fields.get(name) } {
            self.stack[self.stack_top - arg_count - 1] = field;
            return self.call_value(field, arg_count);
        }

        let class = unsafe { (*instance).class };
        self.invoke_from_class(class, name, arg_count)
    }

    fn invoke_from_class(
        &mut self,
        class: *mut ObjectClass,
        name: *mut ObjectString,
        arg_count: usize,
    ) -> Result<(), String> {
        match unsafe { (*class).methods.get(name) } {
            Some(Value::Obj(method)) => self.call(method as *mut ObjectClosure, arg_count),
            _ => Err(format!("Undefined property '{}'.", unsafe {
                &(*name).content
            })),
        }
    }

    fn bind_method(&mut self, class: *mut ObjectClass, name: *mut ObjectString) -> Result<(), String> {
        let method = match unsafe { (*class).methods.get(name) } {
            Some(Value::Obj(method)) => method as *mut ObjectClosure,
            _ => {
                return Err(format!("Undefined property '{}'.", unsafe {
                    &(*name).content
                }))
            }
        };
        let receiver = self.peek(0);
        let bound = self.allocate_bound_method(receiver, method);
        self.pop();
        self.push(Value::Obj(bound as *mut Object));
        Ok(())
    }

    /// Reuse the open upvalue for this slot if one exists; otherwise splice
    /// a new one into the list, keeping it sorted by descending address.
    fn capture_upvalue(&mut self, slot: usize) -> *mut ObjectUpvalue {
        let local = &mut self.stack[slot] as *mut Value;
        let mut prev_upvalue: *mut ObjectUpvalue = null_mut();
        let mut upvalue = self.open_upvalues;
        while !upvalue.is_null() && unsafe { (*upvalue).location } > local {
            prev_upvalue = upvalue;
            upvalue = unsafe { (*upvalue).next };
        }
        if !upvalue.is_null() && unsafe { (*upvalue).location } == local {
            return upvalue;
        }

        let created = self.allocate_upvalue(local);
        unsafe {
            (*created).next = upvalue;
        }
        if prev_upvalue.is_null() {
            self.open_upvalues = created;
        } else {
            unsafe {
                (*prev_upvalue).next = created;
            }
        }
        created
    }

    /// Close every open upvalue at or above the given stack slot: the value
    /// moves into the upvalue and `location` is redirected at it.
    fn close_upvalues(&mut self, last: usize) {
        let boundary = &mut self.stack[last] as *mut Value;
        while !self.open_upvalues.is_null()
            && unsafe { (*self.open_upvalues).location } >= boundary
        {
            let upvalue = self.open_upvalues;
            unsafe {
                (*upvalue).closed = *(*upvalue).location;
                (*upvalue).location = &mut (*upvalue).closed as *mut Value;
                self.open_upvalues = (*upvalue).next;
            }
        }
    }

    fn concatenate(&mut self, a: *mut ObjectString, b: *mut ObjectString) {
        // Operands stay on the stack until the result exists, so a
        // collection inside take_string cannot free them.
        let combined = unsafe {
            let left = &(*a).content;
            let right = &(*b).content;
            let mut combined = String::with_capacity(left.len() + right.len());
            combined.push_str(left);
            combined.push_str(right);
            combined
        };
        let result = self.take_string(combined);
        self.pop();
        self.pop();
        self.push(Value::Obj(result as *mut Object));
    }

    fn binary_number_op(&mut self, opcode: OpCode) -> Result<(), String> {
        let (b, a) = match (self.peek(0), self.peek(1)) {
            (Value::Number(b), Value::Number(a)) => (b, a),
            _ => return Err("Operands must be numbers.".to_string()),
        };
        self.pop();
        self.pop();
        let result = match opcode {
            OpCode::Greater => Value::Bool(a > b),
            OpCode::Less => Value::Bool(a < b),
            OpCode::Subtract => Value::Number(a - b),
            OpCode::Multiply => Value::Number(a * b),
            OpCode::Divide => Value::Number(a / b),
            _ => unreachable!("not a numeric binary opcode"),
        };
        self.push(result);
        Ok(())
    }

    fn run(&mut self) -> Result<(), String> {
        loop {
            debug_feature::trace_execution(self);

            let instruction = self.frame_mut().read_byte();
            match OpCode::from_byte(instruction) {
                None => return Err(format!("Unknown opcode {}.", instruction)),
                Some(OpCode::Constant) => {
                    let constant = self.frame_mut().read_constant();
                    self.push(constant);
                }
                Some(OpCode::Nil) => self.push(Value::Nil),
                Some(OpCode::True) => self.push(Value::Bool(true)),
                Some(OpCode::False) => self.push(Value::Bool(false)),
                Some(OpCode::Pop) => {
                    self.pop();
                }
                Some(OpCode::GetLocal) => {
                    let slot = self.frame_mut().read_byte() as usize;
                    let value = self.stack[self.frame().slots + slot];
                    self.push(value);
                }
                Some(OpCode::SetLocal) => {
                    let slot = self.frame_mut().read_byte() as usize;
                    let value = self.peek(0);
                    let base = self.frame().slots;
                    self.stack[base + slot] = value;
                }
                Some(OpCode::GetGlobal) => {
                    let name = self.frame_mut().read_string();
                    match self.globals.get(name) {
                        Some(value) => self.push(value),
                        None => {
                            return Err(format!("Undefined variable '{}'.", unsafe {
                                &(*name).content
                            }))
                        }
                    }
                }
                Some(OpCode::DefineGlobal) => {
                    let name = self.frame_mut().read_string();
                    let value = self.peek(0);
                    self.globals.set(name, value);
                    self.pop();
                }
                Some(OpCode::SetGlobal) => {
                    let name = self.frame_mut().read_string();
                    let value = self.peek(0);
                    if self.globals.set(name, value) {
                        // Assignment must not create the binding.
                        self.globals.delete(name);
                        return Err(format!("Undefined variable '{}'.", unsafe {
                            &(*name).content
                        }));
                    }
                }
                Some(OpCode::GetUpvalue) => {
                    let slot = self.frame_mut().read_byte() as usize;
                    let upvalue = unsafe { (&(*self.frame().closure).upvalues)[slot] };
                    let value = unsafe { *(*upvalue).location };
                    self.push(value);
                }
                Some(OpCode::SetUpvalue) => {
                    let slot = self.frame_mut().read_byte() as usize;
                    let value = self.peek(0);
                    let upvalue = unsafe { (&(*self.frame().closure).upvalues)[slot] };
                    unsafe {
                        *(*upvalue).location = value;
                    }
                }
                Some(OpCode::GetProperty) => {
                    let name = self.frame_mut().read_string();
                    let instance = match self.peek(0) {
                        Value::Obj(object)
                            if unsafe { (*object).obj_type } == ObjectType::ObjInstance =>
                        {
                            object as *mut ObjectInstance
                        }
                        _ => return Err("Only instances have properties.".to_string()),
                    };
                    if let Some(value) = unsafe { (*instance).fields.get(name) } {
                        self.pop();
                        self.push(value);
                    } else {
                        let class = unsafe { (*instance).class };
                        self.bind_method(class, name)?;
                    }
                }
                Some(OpCode::SetProperty) => {
                    let name = self.frame_mut().read_string();
                    let instance = match self.peek(1) {
                        Value::Obj(object)
                            if unsafe { (*object).obj_type } == ObjectType::ObjInstance =>
                        {
                            object as *mut ObjectInstance
                        }
                        _ => return Err("Only instances have fields.".to_string()),
                    };
                    let value = self.peek(0);
                    unsafe {
                        (*instance).fields.set(name, value);
                    }
                    let value = self.pop();
                    self.pop();
                    self.push(value);
                }
                Some(OpCode::GetSuper) => {
                    let name = self.frame_mut().read_string();
                    let superclass = match self.pop() {
                        Value::Obj(object) => object as *mut ObjectClass,
                        _ => unreachable!("superclass slot does not hold a class"),
                    };
                    self.bind_method(superclass, name)?;
                }
                Some(OpCode::Equal) => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b));
                }
                Some(OpCode::Greater) => self.binary_number_op(OpCode::Greater)?,
                Some(OpCode::Less) => self.binary_number_op(OpCode::Less)?,
                Some(OpCode::Add) => match (self.peek(1), self.peek(0)) {
                    (Value::Number(a), Value::Number(b)) => {
                        self.pop();
                        self.pop();
                        self.push(Value::Number(a + b));
                    }
                    (Value::Obj(a), Value::Obj(b))
                        if unsafe {
                            (*a).obj_type == ObjectType::ObjString
                                && (*b).obj_type == ObjectType::ObjString
                        } =>
                    {
                        self.concatenate(a as *mut ObjectString, b as *mut ObjectString);
                    }
                    _ => return Err("Operands must be two numbers or two strings.".to_string()),
                },
                Some(OpCode::Subtract) => self.binary_number_op(OpCode::Subtract)?,
                Some(OpCode::Multiply) => self.binary_number_op(OpCode::Multiply)?,
                Some(OpCode::Divide) => self.binary_number_op(OpCode::Divide)?,
                Some(OpCode::Not) => {
                    let value = self.pop();
                    self.push(Value::Bool(value.is_falsey()));
                }
                Some(OpCode::Negate) => {
                    let number = match self.peek(0) {
                        Value::Number(number) => number,
                        _ => return Err("Operand must be a number.".to_string()),
                    };
                    self.pop();
                    self.push(Value::Number(-number));
                }
                Some(OpCode::Print) => {
                    let value = self.pop();
                    println!("{}", format_value(&value));
                }
                Some(OpCode::Jump) => {
                    let offset = self.frame_mut().read_short() as usize;
                    self.frame_mut().ip += offset;
                }
                Some(OpCode::JumpIfFalse) => {
                    let offset = self.frame_mut().read_short() as usize;
                    if self.peek(0).is_falsey() {
                        self.frame_mut().ip += offset;
                    }
                }
                Some(OpCode::Loop) => {
                    let offset = self.frame_mut().read_short() as usize;
                    self.frame_mut().ip -= offset;
                }
                Some(OpCode::Call) => {
                    let arg_count = self.frame_mut().read_byte() as usize;
                    let callee = self.peek(arg_count);
                    self.call_value(callee, arg_count)?;
                }
                Some(OpCode::Invoke) => {
                    let method = self.frame_mut().read_string();
                    let arg_count = self.frame_mut().read_byte() as usize;
                    self.invoke(method, arg_count)?;
                }
                Some(OpCode::SuperInvoke) => {
                    let method = self.frame_mut().read_string();
                    let arg_count = self.frame_mut().read_byte() as usize;
                    let superclass = match self.pop() {
                        Value::Obj(object) => object as *mut ObjectClass,
                        _ => unreachable!("superclass slot does not hold a class"),
                    };
                    self.invoke_from_class(superclass, method, arg_count)?;
                }
                Some(OpCode::Closure) => {
                    let function = match self.frame_mut().read_constant() {
                        Value::Obj(object) => object as *mut ObjectFunction,
                        _ => unreachable!("closure operand is not a function"),
                    };
                    let closure = self.allocate_closure(function);
                    // Push before capturing: each capture may allocate.
                    self.push(Value::Obj(closure as *mut Object));
                    let upvalue_count = unsafe { (*function).upvalue_count };
                    for _ in 0..upvalue_count {
                        let is_local = self.frame_mut().read_byte();
                        let index = self.frame_mut().read_byte() as usize;
                        let upvalue = if is_local == 1 {
                            let slot = self.frame().slots + index;
                            self.capture_upvalue(slot)
                        } else {
                            unsafe { (&(*self.frame().closure).upvalues)[index] }
                        };
                        unsafe {
                            (*closure).upvalues.push(upvalue);
                        }
                    }
                }
                Some(OpCode::CloseUpvalue) => {
                    self.close_upvalues(self.stack_top - 1);
                    self.pop();
                }
                Some(OpCode::Return) => {
                    let result = self.pop();
                    let frame = self.frames.pop().expect("call frame underflow");
                    self.close_upvalues(frame.slots);
                    if self.frames.is_empty() {
                        self.pop();
                        return Ok(());
                    }
                    self.stack_top = frame.slots;
                    self.push(result);
                }
                Some(OpCode::Class) => {
                    let name = self.frame_mut().read_string();
                    let class = self.allocate_class(unsafe { (*name).content.clone() });
                    self.push(Value::Obj(class as *mut Object));
                }
                Some(OpCode::Inherit) => {
                    let superclass = match self.peek(1) {
                        Value::Obj(object)
                            if unsafe { (*object).obj_type } == ObjectType::ObjClass =>
                        {
                            object as *mut ObjectClass
                        }
                        _ => return Err("Superclass must be a class.".to_string()),
                    };
                    let subclass = match self.peek(0) {
                        Value::Obj(object) => object as *mut ObjectClass,
                        _ => unreachable!("inherit target is not a class"),
                    };
                    unsafe {
                        Table::add_all(&(*superclass).methods, &mut (*subclass).methods);
                    }
                    self.pop();
                }
                Some(OpCode::Method) => {
                    let name = self.frame_mut().read_string();
                    let method = self.peek(0);
                    let class = match self.peek(1) {
                        Value::Obj(object) => object as *mut ObjectClass,
                        _ => unreachable!("method target is not a class"),
                    };
                    unsafe {
                        (*class).methods.set(name, method);
                    }
                    self.pop();
                }
            }
        }
    }
}

#[cfg(feature = "debug_trace_execution")]
mod debug_feature {
    use super::*;

    pub fn trace_execution(vm: &Vm) {
        print!("{: >10}", "");
        for slot in &vm.stack[0..vm.stack_top] {
            print!(" [ {} ]", format_value(slot));
        }
        println!();
        let frame = &vm.frames[vm.frames.len() - 1];
        crate::debug::disassemble_instruction(frame.chunk(), frame.ip);
    }
}

#[cfg(not(feature = "debug_trace_execution"))]
mod debug_feature {
    use super::*;

    pub fn trace_execution(_vm: &Vm) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_ok(source: &str) -> Vm {
        let mut vm = Vm::new();
        assert_eq!(vm.interpret(source), InterpretResult::InterpretOk);
        vm
    }

    fn expect_string(vm: &mut Vm, global: &str, expected: &str) {
        let interned = vm.copy_string(expected);
        assert_eq!(
            vm.get_global(global),
            Some(Value::Obj(interned as *mut Object))
        );
    }

    #[test]
    fn test_arithmetic() {
        let vm = run_ok("var r = (1 + 2) * 3 - 4 / 2;");
        assert_eq!(vm.get_global("r"), Some(Value::Number(7.0)));
    }

    #[test]
    fn test_print_statement() {
        run_ok("print 1 + 2;");
    }

    #[test]
    fn test_string_concatenation_is_interned() {
        let vm = run_ok("var a = \"hi\" + \" \" + \"there\"; var b = \"hi there\";");
        // Interning makes equal strings pointer-equal at the value level.
        assert_eq!(vm.get_global("a"), vm.get_global("b"));
        assert!(vm.get_global("a").is_some());
    }

    #[test]
    fn test_adding_string_and_number_fails() {
        let mut vm = Vm::new();
        assert_eq!(
            vm.interpret("var r = \"a\" + 1;"),
            InterpretResult::InterpretRuntimeError
        );
    }

    #[test]
    fn test_comparison_and_equality() {
        let vm = run_ok(
            "var r1 = 5 > 3; var r2 = nil == nil; var r3 = \"a\" == \"a\"; var r4 = 1 == \"1\"; var r5 = 2 <= 2;",
        );
        assert_eq!(vm.get_global("r1"), Some(Value::Bool(true)));
        assert_eq!(vm.get_global("r2"), Some(Value::Bool(true)));
        assert_eq!(vm.get_global("r3"), Some(Value::Bool(true)));
        assert_eq!(vm.get_global("r4"), Some(Value::Bool(false)));
        assert_eq!(vm.get_global("r5"), Some(Value::Bool(true)));
    }

    #[test]
    fn test_zero_is_truthy() {
        let mut vm = run_ok("var r = \"no\"; if (0) r = \"yes\";");
        expect_string(&mut vm, "r", "yes");
    }

    #[test]
    fn test_if_else() {
        let vm = run_ok("var r = 0; if (1 > 2) { r = 1; } else { r = 2; }");
        assert_eq!(vm.get_global("r"), Some(Value::Number(2.0)));
    }

    #[test]
    fn test_and_or_short_circuit() {
        let mut vm = run_ok("var r = false or \"yes\"; var s = nil and missing();");
        expect_string(&mut vm, "r", "yes");
        assert_eq!(vm.get_global("s"), Some(Value::Nil));
    }

    #[test]
    fn test_while_loop() {
        let vm = run_ok("var sum = 0; var i = 0; while (i < 5) { sum = sum + i; i = i + 1; }");
        assert_eq!(vm.get_global("sum"), Some(Value::Number(10.0)));
    }

    #[test]
    fn test_for_loop() {
        let vm = run_ok("var sum = 0; for (var i = 1; i <= 4; i = i + 1) { sum = sum + i; }");
        assert_eq!(vm.get_global("sum"), Some(Value::Number(10.0)));
    }

    #[test]
    fn test_recursive_function() {
        let vm = run_ok(
            "fun fib(n) { if (n < 2) return n; return fib(n - 2) + fib(n - 1); } var r = fib(10);",
        );
        assert_eq!(vm.get_global("r"), Some(Value::Number(55.0)));
    }

    #[test]
    fn test_counter_closure_shares_upvalue() {
        let vm = run_ok(
            "fun makeCounter() {
                 var i = 0;
                 fun count() { i = i + 1; return i; }
                 return count;
             }
             var c = makeCounter();
             var r1 = c(); var r2 = c(); var r3 = c();",
        );
        assert_eq!(vm.get_global("r1"), Some(Value::Number(1.0)));
        assert_eq!(vm.get_global("r2"), Some(Value::Number(2.0)));
        assert_eq!(vm.get_global("r3"), Some(Value::Number(3.0)));
    }

    #[test]
    fn test_two_closures_share_one_variable() {
        let vm = run_ok(
            "var set; var get;
             fun pair() {
                 var x = 0;
                 fun doSet(v) { x = v; }
                 fun doGet() { return x; }
                 set = doSet;
                 get = doGet;
             }
             pair();
             set(42);
             var r = get();",
        );
        assert_eq!(vm.get_global("r"), Some(Value::Number(42.0)));
    }

    #[test]
    fn test_upvalue_closed_on_scope_exit() {
        let vm = run_ok(
            "var f;
             {
                 var i = 10;
                 fun g() { return i; }
                 f = g;
             }
             var r = f();",
        );
        assert_eq!(vm.get_global("r"), Some(Value::Number(10.0)));
    }

    #[test]
    fn test_arity_mismatch_is_runtime_error() {
        let mut vm = Vm::new();
        assert_eq!(
            vm.interpret("fun f(a, b) { return a + b; } f(1);"),
            InterpretResult::InterpretRuntimeError
        );
        // No frame was pushed for the failed call; the stack was reset.
        assert_eq!(vm.frames.len(), 0);
        assert_eq!(vm.stack_top, 0);
    }

    #[test]
    fn test_stack_overflow_is_runtime_error() {
        let mut vm = Vm::new();
        assert_eq!(
            vm.interpret("fun f() { f(); } f();"),
            InterpretResult::InterpretRuntimeError
        );
        assert_eq!(vm.frames.len(), 0);
    }

    #[test]
    fn test_undefined_variable_is_runtime_error() {
        let mut vm = Vm::new();
        assert_eq!(
            vm.interpret("print missing;"),
            InterpretResult::InterpretRuntimeError
        );
    }

    #[test]
    fn test_assignment_to_undefined_global() {
        let mut vm = Vm::new();
        assert_eq!(
            vm.interpret("missing = 1;"),
            InterpretResult::InterpretRuntimeError
        );
        // The failed assignment must not leave a binding behind.
        assert_eq!(vm.get_global("missing"), None);
    }

    #[test]
    fn test_calling_non_callable_is_runtime_error() {
        let mut vm = Vm::new();
        assert_eq!(
            vm.interpret("var x = 1; x();"),
            InterpretResult::InterpretRuntimeError
        );
    }

    #[test]
    fn test_compile_error_result() {
        let mut vm = Vm::new();
        assert_eq!(vm.interpret("var;"), InterpretResult::InterpretCompileError);
        assert_eq!(vm.interpret("1 +;"), InterpretResult::InterpretCompileError);
    }

    #[test]
    fn test_repl_state_survives_errors() {
        let mut vm = Vm::new();
        assert_eq!(vm.interpret("var a = 1;"), InterpretResult::InterpretOk);
        assert_eq!(
            vm.interpret("a();"),
            InterpretResult::InterpretRuntimeError
        );
        assert_eq!(vm.interpret("var b = a + 1;"), InterpretResult::InterpretOk);
        assert_eq!(vm.get_global("b"), Some(Value::Number(2.0)));
        assert_eq!(vm.stack_top, 0);
    }

    #[test]
    fn test_class_method_call() {
        let mut vm = run_ok(
            "class Cake { taste() { return \"yum\"; } } var r = Cake().taste();",
        );
        expect_string(&mut vm, "r", "yum");
    }

    #[test]
    fn test_initializer_and_fields() {
        let mut vm = run_ok(
            "class Cake {
                 init(flavor) { this.flavor = flavor; }
                 taste() { return this.flavor; }
             }
             var r = Cake(\"chocolate\").taste();",
        );
        expect_string(&mut vm, "r", "chocolate");
    }

    #[test]
    fn test_implicit_initializer_rejects_arguments() {
        let mut vm = Vm::new();
        assert_eq!(
            vm.interpret("class Empty {} Empty(1);"),
            InterpretResult::InterpretRuntimeError
        );
    }

    #[test]
    fn test_early_return_from_initializer_yields_instance() {
        let vm = run_ok(
            "class C { init() { this.x = 1; return; } } var c = C(); var r = c.x;",
        );
        assert_eq!(vm.get_global("r"), Some(Value::Number(1.0)));
    }

    #[test]
    fn test_inheritance_and_super() {
        let mut vm = run_ok(
            "class A { m() { return \"A\"; } }
             class B < A { m() { return super.m() + \"B\"; } }
             var r = B().m();",
        );
        expect_string(&mut vm, "r", "AB");
    }

    #[test]
    fn test_inherited_method_without_override() {
        let mut vm = run_ok(
            "class A { m() { return \"base\"; } }
             class B < A {}
             var r = B().m();",
        );
        expect_string(&mut vm, "r", "base");
    }

    #[test]
    fn test_super_method_reference() {
        let mut vm = run_ok(
            "class A { m() { return \"A\"; } }
             class B < A { grab() { var f = super.m; return f(); } }
             var r = B().grab();",
        );
        expect_string(&mut vm, "r", "A");
    }

    #[test]
    fn test_inheriting_non_class_is_runtime_error() {
        let mut vm = Vm::new();
        assert_eq!(
            vm.interpret("var NotClass = 1; class Sub < NotClass {}"),
            InterpretResult::InterpretRuntimeError
        );
    }

    #[test]
    fn test_bound_method_keeps_receiver() {
        let vm = run_ok(
            "class C { m() { return this; } } var c = C(); var m = c.m; var r = m();",
        );
        assert_eq!(vm.get_global("r"), vm.get_global("c"));
        assert!(vm.get_global("r").is_some());
    }

    #[test]
    fn test_field_shadows_method_on_invoke() {
        let mut vm = run_ok(
            "class C { m() { return \"method\"; } }
             var c = C();
             fun f() { return \"field\"; }
             c.m = f;
             var r = c.m();",
        );
        expect_string(&mut vm, "r", "field");
    }

    #[test]
    fn test_property_on_non_instance_is_runtime_error() {
        let mut vm = Vm::new();
        assert_eq!(
            vm.interpret("var x = 1; x.field;"),
            InterpretResult::InterpretRuntimeError
        );
        assert_eq!(
            vm.interpret("var y = 1; y.field = 2;"),
            InterpretResult::InterpretRuntimeError
        );
    }

    #[test]
    fn test_undefined_property_is_runtime_error() {
        let mut vm = Vm::new();
        assert_eq!(
            vm.interpret("class C {} var c = C(); c.missing;"),
            InterpretResult::InterpretRuntimeError
        );
    }

    #[test]
    fn test_native_clock_returns_number() {
        let vm = run_ok("var t = clock();");
        match vm.get_global("t") {
            Some(Value::Number(seconds)) => assert!(seconds >= 0.0),
            other => panic!("clock() returned {:?}", other),
        }
    }

    struct Sum;
    impl NativeObject for Sum {
        fn call(&self, args: &[Value]) -> Result<Value, String> {
            let mut total = 0.0;
            for arg in args {
                match arg {
                    Value::Number(n) => total += n,
                    _ => return Err("sum() takes numbers.".to_string()),
                }
            }
            Ok(Value::Number(total))
        }
    }

    #[test]
    fn test_custom_native_function() {
        let mut vm = Vm::new();
        vm.define_native("sum", 2, Box::new(Sum));
        assert_eq!(
            vm.interpret("var r = sum(40, 2);"),
            InterpretResult::InterpretOk
        );
        assert_eq!(vm.get_global("r"), Some(Value::Number(42.0)));
    }

    #[test]
    fn test_native_error_is_runtime_error() {
        let mut vm = Vm::new();
        vm.define_native("sum", 1, Box::new(Sum));
        assert_eq!(
            vm.interpret("sum(\"text\");"),
            InterpretResult::InterpretRuntimeError
        );
    }

    #[test]
    fn test_push_pop_embedding_api() {
        let mut vm = Vm::new();
        vm.push(Value::Number(1.5));
        assert_eq!(vm.pop(), Value::Number(1.5));
    }

    #[test]
    fn test_stress_mode_full_language_pass() {
        let mut vm = Vm::new();
        vm.set_gc_stress(true);
        assert_eq!(
            vm.interpret(
                "class Animal {
                     init(name) { this.name = name; }
                     speak() { return this.name + \" makes a sound\"; }
                 }
                 class Dog < Animal {
                     speak() { return super.speak() + \": woof\"; }
                 }
                 var r = Dog(\"Rex\").speak();",
            ),
            InterpretResult::InterpretOk
        );
        expect_string(&mut vm, "r", "Rex makes a sound: woof");
    }
}
